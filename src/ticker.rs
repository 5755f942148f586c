//! # Delayed, variable-interval ticker.
//!
//! [`DelayedTicker`] decouples "first tick after delay D" from "subsequent
//! ticks every I", and allows I to be changed mid-flight without tearing
//! down the consumer.
//!
//! Emission goes through a capacity-1 channel. The emitting loop blocks on
//! a full channel rather than dropping or backlogging ticks; a pending send
//! is preempted by `stop` so shutdown cannot hang. The channel is never
//! closed under the consumer: the [`DelayedTicker`] itself keeps a sender
//! alive, so a read against a stopped ticker simply never completes instead
//! of yielding a value that could be mistaken for a tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::TickerError;

/// Effective period when the configured interval is zero. This gets close
/// to a spin, be careful.
const SPIN_INTERVAL: Duration = Duration::from_micros(333);

/// Ticker with an initial delay and a reconfigurable steady interval.
pub struct DelayedTicker {
    rx: mpsc::Receiver<Instant>,
    /// Held so the channel outlives every emitting loop.
    tx: mpsc::Sender<Instant>,
    last_tick: Arc<watch::Sender<Instant>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    current_interval: Duration,
    running: bool,
    stopped: bool,
}

impl DelayedTicker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (last_tick, _) = watch::channel(Instant::now());

        Self {
            rx,
            tx,
            last_tick: Arc::new(last_tick),
            cancel: CancellationToken::new(),
            handle: None,
            current_interval: Duration::ZERO,
            running: false,
            stopped: false,
        }
    }

    /// Begins emitting: the first tick fires `delay` from now, subsequent
    /// ticks every `interval`. An interval of zero means back-to-back
    /// ticks after the initial delay.
    pub fn start(&mut self, delay: Duration, interval: Duration) -> Result<(), TickerError> {
        if self.stopped {
            return Err(TickerError::Stopped);
        }
        if self.running {
            return Err(TickerError::AlreadyRunning);
        }

        // take the deadline before any scheduling for the most accurate delay
        let deadline = Instant::now() + delay;
        self.last_tick.send_replace(Instant::now());
        self.current_interval = interval;
        self.spawn_loop(deadline, interval);
        self.running = true;

        Ok(())
    }

    /// Waits for the next tick.
    pub async fn tick(&mut self) -> Instant {
        match self.rx.recv().await {
            Some(at) => at,
            // we hold a sender, so the channel cannot close
            None => std::future::pending().await,
        }
    }

    /// Terminates the ticker. Any tick already buffered is discarded so the
    /// consumer observes no deliveries after this returns.
    pub async fn stop(&mut self) -> Result<(), TickerError> {
        if !self.running {
            return Err(TickerError::NotRunning);
        }

        self.running = false;
        self.stopped = true;
        self.shutdown_loop().await;
        while self.rx.try_recv().is_ok() {}

        Ok(())
    }

    /// Reconfigures the steady interval while running.
    ///
    /// The emitting loop is torn down and restarted with an initial delay of
    /// `interval - time_since_last_tick` (clamped at zero), preserving phase
    /// relative to the last observed tick.
    pub async fn change_interval(&mut self, interval: Duration) -> Result<(), TickerError> {
        if !self.running {
            return Err(TickerError::NotRunning);
        }
        if interval == self.current_interval {
            return Ok(());
        }

        self.shutdown_loop().await;

        let last = *self.last_tick.borrow();
        let deadline = Instant::now().max(last + interval);
        self.current_interval = interval;
        self.spawn_loop(deadline, interval);

        Ok(())
    }

    fn spawn_loop(&mut self, deadline: Instant, interval: Duration) {
        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();
        self.handle = Some(tokio::spawn(run_loop(
            deadline,
            interval,
            self.tx.clone(),
            self.last_tick.clone(),
            cancel,
        )));
    }

    async fn shutdown_loop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Default for DelayedTicker {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_loop(
    deadline: Instant,
    interval: Duration,
    tx: mpsc::Sender<Instant>,
    last_tick: Arc<watch::Sender<Instant>>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = time::sleep_until(deadline) => {}
    }
    if !emit(&tx, &last_tick, &cancel).await {
        return;
    }

    let period = if interval.is_zero() {
        SPIN_INTERVAL
    } else {
        interval
    };
    let mut steady = time::interval_at(Instant::now() + period, period);
    steady.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = steady.tick() => {}
        }
        if !emit(&tx, &last_tick, &cancel).await {
            return;
        }
    }
}

/// Sends one tick, blocking until the consumer has room. Returns false when
/// the loop should exit (stop requested, or the consumer is gone).
async fn emit(
    tx: &mpsc::Sender<Instant>,
    last_tick: &watch::Sender<Instant>,
    cancel: &CancellationToken,
) -> bool {
    let now = Instant::now();
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(now) => {
            if sent.is_ok() {
                last_tick.send_replace(now);
                true
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn delayed_start_then_steady_interval() {
        let delay = Duration::from_secs(1);
        let interval = Duration::from_millis(100);

        let mut dt = DelayedTicker::new();
        let started = Instant::now();
        dt.start(delay, interval).unwrap();

        let mut ticks = [started; 6];
        for t in ticks.iter_mut() {
            *t = dt.tick().await;
        }
        dt.stop().await.unwrap();

        assert!(ticks[0] - started <= delay + EPS);
        for pair in ticks.windows(2) {
            assert!(pair[1] - pair[0] <= interval + EPS);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_ticks_continuously() {
        let mut dt = DelayedTicker::new();
        let started = Instant::now();
        dt.start(Duration::ZERO, Duration::ZERO).unwrap();

        let mut ticks = [started; 6];
        for t in ticks.iter_mut() {
            *t = dt.tick().await;
        }
        dt.stop().await.unwrap();

        assert!(ticks[0] - started <= EPS);
        for pair in ticks.windows(2) {
            assert!(pair[1] - pair[0] <= EPS);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_silences_channel_without_closing_it() {
        let mut dt = DelayedTicker::new();
        dt.start(Duration::ZERO, Duration::from_secs(10)).unwrap();

        dt.tick().await;
        dt.stop().await.unwrap();

        // the channel stays open, the read just never completes
        let res = time::timeout(Duration::from_secs(30), dt.tick()).await;
        assert!(res.is_err(), "stopped ticker still produced a tick");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_twice_reports_an_error() {
        let mut dt = DelayedTicker::new();
        dt.start(Duration::ZERO, Duration::from_secs(10)).unwrap();

        assert!(dt.stop().await.is_ok());
        assert_eq!(dt.stop().await, Err(TickerError::NotRunning));
        assert_eq!(
            dt.change_interval(Duration::from_secs(1000)).await,
            Err(TickerError::NotRunning)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_and_start_after_stop_are_errors() {
        let mut dt = DelayedTicker::new();
        dt.start(Duration::ZERO, Duration::from_secs(1)).unwrap();
        assert_eq!(
            dt.start(Duration::ZERO, Duration::from_secs(1)),
            Err(TickerError::AlreadyRunning)
        );

        dt.tick().await;
        dt.stop().await.unwrap();
        assert_eq!(
            dt.start(Duration::ZERO, Duration::from_secs(1)),
            Err(TickerError::Stopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_preserves_phase() {
        let first = Duration::from_millis(100);
        let second = Duration::from_millis(150);

        let mut dt = DelayedTicker::new();
        let started = Instant::now();
        dt.start(Duration::ZERO, first).unwrap();

        let mut ticks = [started; 10];
        for (i, t) in ticks.iter_mut().enumerate() {
            *t = dt.tick().await;
            if i == 5 {
                dt.change_interval(second).await.unwrap();
            }
        }
        dt.stop().await.unwrap();

        assert!(ticks[0] - started <= EPS);
        for (i, pair) in ticks.windows(2).enumerate() {
            // windows index 5 is the gap between ticks 5 and 6, the first
            // one scheduled under the new interval
            let expected = if i >= 5 { second } else { first };
            assert!(
                pair[1] - pair[0] <= expected + EPS,
                "tick {} late: {:?}",
                i + 1,
                pair[1] - pair[0]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn change_to_same_interval_is_a_no_op() {
        let interval = Duration::from_millis(100);

        let mut dt = DelayedTicker::new();
        dt.start(Duration::ZERO, interval).unwrap();

        dt.tick().await;
        dt.change_interval(interval).await.unwrap();

        let next = dt.tick().await;
        let after = dt.tick().await;
        assert!(after - next <= interval + EPS);

        dt.stop().await.unwrap();
    }
}
