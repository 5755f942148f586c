//! # Per-rule execution driver.
//!
//! A [`RuleDriver`] owns one rule for the lifetime of the process: it waits
//! on its [`DelayedTicker`], executes one probe per tick, supervises the
//! subprocess with two-stage timeout escalation (interrupt, then kill),
//! classifies the outcome, debounces state changes, and fires the
//! configured change command when a transition sticks.
//!
//! Runs are strictly serialized: the next tick is not consumed until the
//! current run's state handling is complete. When the driver leaves the
//! run-time set (run cap reached, disabled, or an unmanageable probe) it
//! reports a single [`Completion`] to the dispatcher and terminates.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Sleep};

use crate::rule::{Rule, RuleState, RuleStatus};
use crate::sink::Log;
use crate::ticker::DelayedTicker;

/// Cap on captured probe output, per stream.
const OUTPUT_CAP: u64 = 4 * 1024 * 1024;

/// Result record of the most recent run.
#[derive(Debug, Default)]
pub struct RunRecord {
    pub exec_duration: Duration,
    pub error: Option<io::Error>,
    pub exit_status: i32,
    pub state_changed: bool,
}

/// Completion notice sent to the dispatcher when a driver terminates.
///
/// Exactly one is sent per driver, whether the rule ran to its cap, was
/// configured disabled, or could not start its probe at all.
#[derive(Debug)]
pub struct Completion {
    pub rule_name: String,
    pub run_count: u64,
    pub last: RunRecord,
}

/// Drives a single rule across its entire lifetime.
pub struct RuleDriver {
    rule: Rule,
    log: Log,
    done: mpsc::Sender<Completion>,
    app_instance: u64,
    count: u64,
    last: RunRecord,
    last_state: RuleState,
    debounce: u16,
}

impl RuleDriver {
    /// `app_instance` is a process-wide epoch offset used only for log
    /// correlation; zero omits it from run identifiers.
    pub fn new(rule: Rule, log: Log, done: mpsc::Sender<Completion>, app_instance: u64) -> Self {
        Self {
            rule,
            log,
            done,
            app_instance,
            count: 0,
            last: RunRecord::default(),
            last_state: RuleState::Unknown,
            debounce: 0,
        }
    }

    /// Stable identifier of the current run, for log correlation.
    fn run_uid(&self) -> String {
        if self.app_instance != 0 {
            format!("{:x}:{}:{:x}", self.app_instance, self.rule.name, self.count)
        } else {
            format!("{}:{:x}", self.rule.name, self.count)
        }
    }

    /// Executes the rule until it disables itself, then reports completion.
    pub async fn run(mut self) {
        let mut ticker = DelayedTicker::new();

        self.log
            .debug(format!(
                "'{}' first run in {:?}",
                self.rule.name, self.rule.start_delay
            ))
            .await;
        if let Err(e) = ticker.start(self.rule.start_delay, self.rule.interval) {
            self.log
                .error(format!(
                    "'{}' could not start its ticker: {}, disabling",
                    self.rule.name, e
                ))
                .await;
            self.rule.status = RuleStatus::Disabled;
        }

        while self.rule.status != RuleStatus::Disabled {
            self.log
                .debug(format!(
                    "'{}' run {}, waiting for next event",
                    self.rule.name,
                    self.run_uid()
                ))
                .await;
            ticker.tick().await;
            self.run_once(&mut ticker).await;
        }

        let _ = ticker.stop().await;
        let _ = self
            .done
            .send(Completion {
                rule_name: self.rule.name,
                run_count: self.count,
                last: self.last,
            })
            .await;
    }

    /// One end-to-end probe run: spawn, supervise, classify, update state,
    /// enforce the run cap.
    async fn run_once(&mut self, ticker: &mut DelayedTicker) {
        let started = Instant::now();
        self.count += 1;
        self.last = RunRecord::default();

        self.log
            .debug(format!(
                "'{}' starting run {}",
                self.rule.name,
                self.run_uid()
            ))
            .await;

        let mut cmd = Command::new(&self.rule.test);
        cmd.args(&self.rule.test_arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.rule.status = RuleStatus::Disabled;
                self.log
                    .error(format!(
                        "'{}' {} failed to start, disabling: {}",
                        self.rule.name,
                        self.run_uid(),
                        e
                    ))
                    .await;
                return;
            }
        };

        // drain pipes concurrently so the child cannot stall on them
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(read_capped(stdout));
        let err_task = tokio::spawn(read_capped(stderr));

        self.supervise(&mut child).await;

        let out = out_task.await.unwrap_or_default();
        let err = err_task.await.unwrap_or_default();
        self.last.exec_duration = started.elapsed();

        self.handle_buffers(&out, &err).await;
        self.update_state(ticker).await;

        if self.rule.runs > 0 && self.count >= u64::from(self.rule.runs) {
            self.log
                .debug(format!(
                    "'{}' run {}, runs configured exceeded, disabling",
                    self.rule.name,
                    self.run_uid()
                ))
                .await;
            self.rule.status = RuleStatus::Disabled;
        }
    }

    /// Waits for the probe to exit, escalating through the interrupt and
    /// kill deadlines. A deadline is armed only when its timeout is
    /// non-zero, and each fires at most once; the exit event abandons
    /// whatever is still pending.
    async fn supervise(&mut self, child: &mut Child) {
        let mut int_deadline = arm(self.rule.timeout_int);
        let mut kill_deadline = arm(self.rule.timeout_kill);

        loop {
            tokio::select! {
                res = child.wait() => {
                    self.handle_exit(res).await;
                    return;
                }
                _ = fire(&mut int_deadline) => {
                    self.handle_interrupt_timeout(child).await;
                }
                _ = fire(&mut kill_deadline) => {
                    self.handle_kill_timeout(child).await;
                }
            }
        }
    }

    async fn handle_exit(&mut self, res: io::Result<std::process::ExitStatus>) {
        match res {
            Ok(status) if status.success() => {}
            Ok(status) => {
                self.log
                    .error(format!(
                        "'{}' run {} completed with error: {}",
                        self.rule.name,
                        self.run_uid(),
                        status
                    ))
                    .await;
                self.last.exit_status = exit_code(status);
            }
            Err(e) => {
                self.log
                    .error(format!(
                        "'{}' run {} completed with error: {}",
                        self.rule.name,
                        self.run_uid(),
                        e
                    ))
                    .await;
                self.last.error = Some(e);
            }
        }
    }

    async fn handle_interrupt_timeout(&mut self, child: &Child) {
        self.log
            .info(format!(
                "'{}' run {} interrupt timeout exceeded, issuing interrupt.",
                self.rule.name,
                self.run_uid()
            ))
            .await;
        if let Err(e) = interrupt(child) {
            self.log
                .error(format!(
                    "'{}' run {} failed to interrupt test process: {}, disabling further checks",
                    self.rule.name,
                    self.run_uid(),
                    e
                ))
                .await;
            self.rule.status = RuleStatus::Disabled;
        }
    }

    async fn handle_kill_timeout(&mut self, child: &mut Child) {
        self.log
            .warning(format!(
                "'{}' run {} kill timeout exceeded, issuing kill.",
                self.rule.name,
                self.run_uid()
            ))
            .await;
        if let Err(e) = child.start_kill() {
            self.log
                .error(format!(
                    "'{}' run {} failed to kill test process: {}, disabling further checks",
                    self.rule.name,
                    self.run_uid(),
                    e
                ))
                .await;
            self.rule.status = RuleStatus::Disabled;
        }
    }

    /// Logs any output the probe produced; stdout is informational, stderr
    /// is an error.
    async fn handle_buffers(&mut self, out: &[u8], err: &[u8]) {
        if !out.is_empty() {
            self.log
                .info(format!(
                    "'{}' run {} test produced output: {}",
                    self.rule.name,
                    self.run_uid(),
                    String::from_utf8_lossy(out)
                ))
                .await;
        }
        if !err.is_empty() {
            self.log
                .error(format!(
                    "'{}' run {} test produced error output: {}",
                    self.rule.name,
                    self.run_uid(),
                    String::from_utf8_lossy(err)
                ))
                .await;
        }
    }

    /// Classifies the run and applies the debounced transition rules.
    async fn update_state(&mut self, ticker: &mut DelayedTicker) {
        let failed = self.last.error.is_some()
            || self.last.exit_status != 0
            || self.rule.status == RuleStatus::AlwaysFail;
        let new_state = if failed && self.rule.status != RuleStatus::AlwaysSuccess {
            RuleState::Fail
        } else {
            RuleState::Success
        };

        // an Unknown or Always* rule transitions unconditionally
        if self.last_state == RuleState::Unknown
            || self.rule.status == RuleStatus::AlwaysFail
            || self.rule.status == RuleStatus::AlwaysSuccess
        {
            self.handle_state_change(new_state, ticker).await;
        } else if self.last_state != new_state {
            self.debounce += 1;
            let threshold = if new_state == RuleState::Fail {
                self.rule.change_fail_debounce
            } else {
                self.rule.change_success_debounce
            };

            if self.debounce >= threshold {
                self.debounce = 0;
                self.handle_state_change(new_state, ticker).await;
            } else {
                self.log
                    .info(format!(
                        "'{}' run {} debounced state change to {}, require {} more consecutive results",
                        self.rule.name,
                        self.run_uid(),
                        new_state,
                        threshold - self.debounce
                    ))
                    .await;
            }
        } else {
            self.debounce = 0;
        }
    }

    /// A transition stuck: record the new state, move the ticker to the
    /// state's interval, and fire the configured change command without
    /// awaiting it.
    async fn handle_state_change(&mut self, new_state: RuleState, ticker: &mut DelayedTicker) {
        self.log
            .warning(format!(
                "'{}' run {} changed state to: {}",
                self.rule.name,
                self.run_uid(),
                new_state
            ))
            .await;

        self.last_state = new_state;
        self.last.state_changed = true;

        let (cmd, args, interval) = if new_state == RuleState::Success {
            (
                self.rule.change_success.clone(),
                self.rule.change_success_arguments.clone(),
                self.rule.interval,
            )
        } else {
            (
                self.rule.change_fail.clone(),
                self.rule.change_fail_arguments.clone(),
                self.rule.interval_fail,
            )
        };

        if let Err(e) = ticker.change_interval(interval).await {
            self.log
                .error(format!(
                    "'{}' run {} could not reschedule: {}, disabling further checks",
                    self.rule.name,
                    self.run_uid(),
                    e
                ))
                .await;
            self.rule.status = RuleStatus::Disabled;
        }
        self.log
            .debug(format!(
                "'{}' run {}, scheduling run in {:?}",
                self.rule.name,
                self.run_uid(),
                interval
            ))
            .await;

        if cmd.is_empty() {
            return;
        }

        let log = self.log.clone();
        let name = self.rule.name.clone();
        let uid = self.run_uid();

        // fire and forget; change commands run to completion, unbounded
        tokio::spawn(async move {
            let result = Command::new(&cmd)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await;

            match result {
                Ok(output) => {
                    if !output.stdout.is_empty() {
                        log.info(format!(
                            "'{}' run {} change command produced output: {}",
                            name,
                            uid,
                            String::from_utf8_lossy(&output.stdout)
                        ))
                        .await;
                    }
                    if !output.stderr.is_empty() {
                        log.error(format!(
                            "'{}' run {} change command produced error output: {}",
                            name,
                            uid,
                            String::from_utf8_lossy(&output.stderr)
                        ))
                        .await;
                    }
                }
                Err(e) => {
                    log.error(format!(
                        "'{}' run {} change command failed: {}",
                        name, uid, e
                    ))
                    .await;
                }
            }
        });
    }
}

/// Reads a child stream to the end, capped at [`OUTPUT_CAP`] bytes.
async fn read_capped<R>(stream: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(stream) = stream {
        let _ = stream.take(OUTPUT_CAP).read_to_end(&mut buf).await;
    }
    buf
}

/// Arms a deadline when the timeout is non-zero.
fn arm(timeout: Duration) -> Option<Pin<Box<Sleep>>> {
    (!timeout.is_zero()).then(|| Box::pin(time::sleep(timeout)))
}

/// Completes once when the armed deadline fires; never completes while
/// disarmed.
async fn fire(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot.as_mut() {
        Some(sleep) => {
            sleep.as_mut().await;
            *slot = None;
        }
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) -> io::Result<()> {
    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "process already reaped"))?;
    // SAFETY: signaling a child we spawned and still hold
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn interrupt(child: &Child) -> io::Result<()> {
    // no interruption signal to speak of, fall through to a hard kill
    let _ = child;
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interrupt signals are not supported on this platform",
    ))
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // mirror the shell convention for signal deaths
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sink::testing::MemorySink;

    async fn run_rule(cfg: &str) -> Completion {
        let config: Config = cfg.parse().unwrap();
        let rule = config.rules["default"].clone();

        let (tx, mut rx) = mpsc::channel(1);
        let log = Log::new(MemorySink::new());
        tokio::spawn(RuleDriver::new(rule, log, tx, 0).run());
        rx.recv().await.unwrap()
    }

    /// Polls until `check` passes, for effects of fire-and-forget commands.
    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn run_cap_of_one_performs_exactly_one_run() {
        let done = run_rule(r#"runs=1; test="true""#).await;
        assert_eq!(done.rule_name, "default");
        assert_eq!(done.run_count, 1);
        assert_eq!(done.last.exit_status, 0);
        assert!(done.last.error.is_none());
    }

    #[tokio::test]
    async fn disabled_rule_runs_zero_times() {
        let done = run_rule(r#"status=disabled; test="false""#).await;
        assert_eq!(done.run_count, 0);
        assert_eq!(done.last.exit_status, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_status_is_captured() {
        let done = run_rule(r#"runs=1; test="false""#).await;
        assert_eq!(done.last.exit_status, 1);
    }

    #[tokio::test]
    async fn unspawnable_test_disables_after_one_completion() {
        let done = run_rule(r#"test="/nonexistent/fitvisor-no-such-probe""#).await;
        assert_eq!(done.run_count, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_deadline_preempts_a_slow_probe() {
        let started = std::time::Instant::now();
        let done = run_rule(r#"runs=1; timeout_int=10ms; test="sleep"; test_arguments="2""#).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
        // died by SIGINT, not a clean exit
        assert_ne!(done.last.exit_status, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_deadline_preempts_an_interrupt_immune_probe() {
        let started = std::time::Instant::now();
        let done = run_rule(
            r#"runs=1; timeout_int=0; timeout_kill=10ms; test="/bin/sh"; test_arguments=[ "-c", "trap '' INT; sleep 2" ]"#,
        )
        .await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
        assert_ne!(done.last.exit_status, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_is_observed_before_kill_on_an_immune_probe() {
        let config: Config = r#"runs=1; timeout_int=10ms; timeout_kill=100ms; test="/bin/sh"; test_arguments=[ "-c", "trap '' INT; sleep 2" ]"#
            .parse()
            .unwrap();
        let rule = config.rules["default"].clone();

        let sink = MemorySink::new();
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(RuleDriver::new(rule, Log::new(sink.clone()), tx, 0).run());

        let started = std::time::Instant::now();
        rx.recv().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let lines = sink.lines.lock().unwrap();
        let interrupt_at = lines
            .iter()
            .position(|(_, m)| m.contains("interrupt timeout exceeded"));
        let kill_at = lines
            .iter()
            .position(|(_, m)| m.contains("kill timeout exceeded"));
        assert!(interrupt_at.is_some(), "interrupt deadline never fired");
        assert!(kill_at.is_some(), "kill deadline never fired");
        assert!(interrupt_at < kill_at, "kill observed before interrupt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn change_fail_command_fires_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("present");
        std::fs::write(&marker, "x").unwrap();

        let cfg = format!(
            r#"runs=1; test="false"; change_fail="rm"; change_fail_arguments="{}""#,
            marker.display()
        );
        let done = run_rule(&cfg).await;
        assert_eq!(done.last.exit_status, 1);
        assert!(done.last.state_changed);

        assert!(
            eventually(|| !marker.exists()).await,
            "change_fail did not remove {marker:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn change_success_command_fires_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("present");
        std::fs::write(&marker, "x").unwrap();

        let cfg = format!(
            r#"runs=1; test="true"; change_success="rm"; change_success_arguments="{}""#,
            marker.display()
        );
        let done = run_rule(&cfg).await;
        assert_eq!(done.last.exit_status, 0);
        assert!(done.last.state_changed);

        assert!(
            eventually(|| !marker.exists()).await,
            "change_success did not remove {marker:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn debounce_fires_the_fail_command_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("counter");
        let fired = dir.path().join("fired");

        // observation sequence 0,1,0,1,1,0,1,1,1,0: failures on runs
        // 2,4,5,7,8,9; with a fail debounce of 3 the only transition to
        // Fail lands on the 9th run
        let probe = format!(
            "n=$(cat {ctr} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {ctr}; \
             case $n in 2|4|5|7|8|9) exit 1;; esac; exit 0",
            ctr = counter.display()
        );
        let cfg = format!(
            r#"
runs=10
interval=10ms
change_fail_debounce=3
test="/bin/sh"
test_arguments=[ "-c", "{probe}" ]
change_fail="/bin/sh"
change_fail_arguments=[ "-c", "echo fired >> {fired}" ]
"#,
            probe = probe.replace('"', "\\\""),
            fired = fired.display()
        );

        let done = run_rule(&cfg).await;
        assert_eq!(done.run_count, 10);

        assert!(eventually(|| fired.exists()).await, "fail command never ran");
        // allow any straggler spawn to land before counting
        time::sleep(Duration::from_millis(100)).await;
        let lines = std::fs::read_to_string(&fired).unwrap();
        assert_eq!(lines.lines().count(), 1, "fail command fired more than once");
    }
}
