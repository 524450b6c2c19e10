use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Inactivity watchdog for a streaming read loop.
///
/// The owner calls [`StallWatch::touch`] whenever bytes arrive and races
/// [`StallWatch::stalled`] against the next read. Checks happen on a fixed
/// interval, so a stall is reported at most one interval after the threshold
/// is crossed.
#[derive(Debug)]
pub struct StallWatch {
    last_activity: Instant,
    threshold: Duration,
    interval: Interval,
}

impl StallWatch {
    pub fn new(threshold: Duration, check_every: Duration) -> Self {
        let check_every = check_every.max(Duration::from_millis(1));
        let now = Instant::now();
        let mut interval = interval_at(now + check_every, check_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            last_activity: now,
            threshold,
            interval,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Resolves with the idle duration once a check finds the threshold exceeded.
    /// Cancel-safe: dropping the future loses nothing.
    pub async fn stalled(&mut self) -> Duration {
        loop {
            self.interval.tick().await;
            let idle = self.idle();
            if idle > self.threshold {
                return idle;
            }
        }
    }
}
