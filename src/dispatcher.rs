//! # Rule dispatch.
//!
//! The [`Dispatcher`] takes the resolved rule set, condenses it into
//! buckets keyed by `start_delay`, and releases each bucket at its offset
//! from a single wall-clock reference taken at dispatch start (so drift is
//! not accumulated across buckets). Within a bucket, drivers launch in
//! parse order; across buckets, ascending delay order. It then waits for
//! exactly one [`Completion`] per rule.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::config::Config;
use crate::driver::{Completion, RuleDriver};
use crate::rule::Rule;
use crate::sink::Log;

/// Reference epoch for run-correlation instance ids, 2026-08-01T00:00:00Z.
const APP_EPOCH_SECS: u128 = 1_785_542_400;

/// Nanosecond offset of process start from the crate epoch. Close enough
/// for log correlation across restarts.
fn app_instance() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|since| since.as_nanos().checked_sub(APP_EPOCH_SECS * 1_000_000_000))
        .map(|offset| offset as u64)
        .unwrap_or(0)
}

/// Condenses the rule set into per-`start_delay` buckets.
///
/// Returns the distinct delays in ascending order and a bucket map whose
/// vectors preserve the parse order of their rules.
fn schedule_rules(
    order: &[String],
    rules: &HashMap<String, Rule>,
) -> (Vec<Duration>, HashMap<Duration, Vec<Rule>>) {
    let mut delays = Vec::new();
    let mut buckets: HashMap<Duration, Vec<Rule>> = HashMap::new();

    for name in order {
        let Some(rule) = rules.get(name) else {
            continue;
        };
        buckets
            .entry(rule.start_delay)
            .or_insert_with(|| {
                delays.push(rule.start_delay);
                Vec::new()
            })
            .push(rule.clone());
    }

    delays.sort();
    (delays, buckets)
}

/// Launches one driver per resolved rule and waits for all of them.
pub struct Dispatcher {
    log: Log,
}

impl Dispatcher {
    pub fn new(log: Log) -> Self {
        Self { log }
    }

    /// Runs every rule to completion; returns the number of completions
    /// received, which equals the resolved rule count.
    pub async fn run(&self, config: &Config) -> usize {
        let total = config.rules.len();
        if total == 0 {
            return 0;
        }

        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(total);
        let (delays, mut buckets) = schedule_rules(&config.order, &config.rules);
        let instance = app_instance();

        let log = self.log.clone();
        let t0 = Instant::now();
        let done_tx_task = done_tx.clone();
        tokio::spawn(async move {
            let done_tx = done_tx_task;
            for delay in delays {
                let target = t0 + delay;
                log.debug(format!(
                    "Running bucket {:?}, should delay by {:?}",
                    delay,
                    target.saturating_duration_since(Instant::now())
                ))
                .await;
                // past targets return immediately
                time::sleep_until(target).await;

                for rule in buckets.remove(&delay).unwrap_or_default() {
                    log.debug(format!("Dispatching rule '{}'", rule.name)).await;
                    log.debug(format!("{} details: {:?}", rule.name, rule)).await;

                    // the driver gets its own copy of the rule, safe from
                    // side effects later
                    let driver = RuleDriver::new(rule, log.clone(), done_tx.clone(), instance);
                    tokio::spawn(driver.run());
                }
            }
        });
        drop(done_tx);

        let mut completed = 0;
        while completed < total {
            match done_rx.recv().await {
                Some(done) => {
                    completed += 1;
                    self.log
                        .info(format!(
                            "'{}' completed execution. Ran for: {:?}",
                            done.rule_name, done.last.exec_duration
                        ))
                        .await;
                }
                None => break,
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::MemorySink;

    fn parse(cfg: &str) -> Config {
        cfg.parse().unwrap()
    }

    #[test]
    fn empty_schedule_for_empty_config() {
        let c = Config::default();
        let (delays, buckets) = schedule_rules(&c.order, &c.rules);
        assert!(delays.is_empty());
        assert!(buckets.is_empty());
    }

    #[test]
    fn single_rule_lands_in_the_zero_bucket() {
        let c = parse(r#"test = "true""#);
        let (delays, buckets) = schedule_rules(&c.order, &c.rules);

        assert_eq!(delays, vec![Duration::ZERO]);
        assert_eq!(buckets[&Duration::ZERO][0].test, "true");
    }

    #[test]
    fn bucket_key_is_the_start_delay() {
        let c = parse(r#"start_delay = 500ms; test = "true""#);
        let (delays, buckets) = schedule_rules(&c.order, &c.rules);

        assert_eq!(delays, vec![Duration::from_millis(500)]);
        assert_eq!(buckets[&delays[0]][0].name, "default");
    }

    #[test]
    fn inherited_start_delay_buckets_the_group_rule() {
        let c = parse(r#"start_delay = 500ms; g1 { t1 { test = "true" } }"#);
        let (delays, buckets) = schedule_rules(&c.order, &c.rules);

        assert_eq!(delays, vec![Duration::from_millis(500)]);
        let bucket = &buckets[&delays[0]];
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].name, "g1/t1");
    }

    #[test]
    fn delays_are_released_in_ascending_order() {
        let c = parse(
            r#"
g1 {
    t50  { start_delay = 50ms; test = "true" }
    t500 { start_delay = 500ms; test = "true" }
    t0   { test = "true" }
}"#,
        );
        let (delays, buckets) = schedule_rules(&c.order, &c.rules);

        let expected = [
            (Duration::ZERO, "g1/t0"),
            (Duration::from_millis(50), "g1/t50"),
            (Duration::from_millis(500), "g1/t500"),
        ];
        assert_eq!(delays.len(), 3);
        for (delay, (expected_delay, name)) in delays.iter().zip(expected) {
            assert_eq!(*delay, expected_delay);
            assert_eq!(buckets[delay].len(), 1);
            assert_eq!(buckets[delay][0].name, name);
        }
    }

    #[test]
    fn buckets_preserve_group_declaration_order() {
        let c = parse(
            r#"
g1 {
    t0   { test = "true" }
    t50  { start_delay = 50ms; test = "true" }
    t500 { start_delay = 500ms; test = "true" }
}
g2 {
    t50  { start_delay = 50ms; test = "true" }
    t500 { start_delay = 500ms; test = "true" }
    t0   { test = "true" }
}
g3 {
    t500 { start_delay = 500ms; test = "true" }
    t0   { test = "true" }
    t50  { start_delay = 50ms; test = "true" }
}"#,
        );
        let (delays, buckets) = schedule_rules(&c.order, &c.rules);

        let expected = [
            (Duration::ZERO, ["g1/t0", "g2/t0", "g3/t0"]),
            (Duration::from_millis(50), ["g1/t50", "g2/t50", "g3/t50"]),
            (
                Duration::from_millis(500),
                ["g1/t500", "g2/t500", "g3/t500"],
            ),
        ];
        assert_eq!(delays.len(), 3);
        for (delay, (expected_delay, names)) in delays.iter().zip(expected) {
            assert_eq!(*delay, expected_delay);
            let got: Vec<_> = buckets[delay].iter().map(|r| r.name.as_str()).collect();
            assert_eq!(got, names);
        }
    }

    #[tokio::test]
    async fn empty_config_completes_immediately() {
        let dispatcher = Dispatcher::new(Log::new(MemorySink::new()));
        let completed = dispatcher.run(&Config::default()).await;
        assert_eq!(completed, 0);
    }

    #[tokio::test]
    async fn one_completion_per_rule() {
        let c = parse(
            r#"
r1 { runs=1; test="true" }
r2 { runs=1; test="false" }
r3 { runs=2; interval=10ms; test="true" }
"#,
        );
        let dispatcher = Dispatcher::new(Log::new(MemorySink::new()));
        let completed = dispatcher.run(&c).await;
        assert_eq!(completed, 3);
    }

    #[tokio::test]
    async fn earlier_buckets_complete_first() {
        let c = parse(
            r#"
late  { start_delay = 300ms; runs=1; test="true" }
early { runs=1; test="true" }
"#,
        );
        let sink = MemorySink::new();
        let dispatcher = Dispatcher::new(Log::new(sink.clone()));
        let completed = dispatcher.run(&c).await;
        assert_eq!(completed, 2);

        let lines = sink.lines.lock().unwrap();
        let order: Vec<_> = lines
            .iter()
            .filter(|(_, m)| m.contains("completed execution"))
            .map(|(_, m)| m.clone())
            .collect();
        assert_eq!(order.len(), 2);
        assert!(order[0].contains("'early'"), "got {order:?}");
        assert!(order[1].contains("'late'"), "got {order:?}");
    }
}
