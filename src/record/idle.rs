//! Idle connection reaping

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Never poll more often than this
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);
/// Never poll less often than this
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(2);

/// Polling frequency for an idle timeout
pub fn reap_interval(idle_timeout: Duration) -> Duration {
    idle_timeout.clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL)
}

/// Timestamp of the most recent claim attempt, readable without locks
#[derive(Debug)]
pub struct ClaimClock {
    base: Instant,
    last_attempt_ms: AtomicU64,
}

impl ClaimClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_attempt_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_attempt_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    pub fn last_attempt(&self) -> Instant {
        self.base + Duration::from_millis(self.last_attempt_ms.load(Ordering::Acquire))
    }

    /// Time since the last claim attempt (or since creation)
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_attempt())
    }
}

impl Default for ClaimClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic idle check owned by a record's task
#[derive(Debug)]
pub struct IdleReaper {
    idle_timeout: Option<Duration>,
    interval: Option<Interval>,
}

impl IdleReaper {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout: idle_timeout.filter(|timeout| !timeout.is_zero()),
            interval: None,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Start polling if reaping is configured and not yet scheduled
    pub fn ensure_started(&mut self) {
        if self.interval.is_some() {
            return;
        }
        if let Some(timeout) = self.idle_timeout {
            let period = reap_interval(timeout);
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.interval = Some(interval);
        }
    }

    pub fn stop(&mut self) {
        self.interval = None;
    }

    /// Check whether the connection has gone unclaimed for the full timeout
    pub fn is_expired(&self, clock: &ClaimClock) -> bool {
        match self.idle_timeout {
            Some(timeout) => clock.idle_for() >= timeout,
            None => false,
        }
    }

    /// Resolves on the next poll; pends forever while stopped
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reap_interval_bounds() {
        assert_eq!(reap_interval(Duration::from_millis(10)), Duration::from_millis(100));
        assert_eq!(reap_interval(Duration::from_millis(500)), Duration::from_millis(500));
        assert_eq!(reap_interval(Duration::from_secs(60)), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_clock_tracks_attempts() {
        let clock = ClaimClock::new();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(clock.idle_for() >= Duration::from_secs(3));

        clock.touch();
        assert!(clock.idle_for() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_expiry() {
        let clock = ClaimClock::new();
        let mut reaper = IdleReaper::new(Some(Duration::from_secs(1)));
        assert!(!reaper.is_running());

        reaper.ensure_started();
        assert!(reaper.is_running());
        assert!(!reaper.is_expired(&clock));

        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert!(reaper.is_expired(&clock));

        reaper.stop();
        assert!(!reaper.is_running());
    }

    #[test]
    fn test_disabled_reaper_never_expires() {
        let clock = ClaimClock::new();
        let mut reaper = IdleReaper::new(None);
        reaper.ensure_started();
        assert!(!reaper.is_running());
        assert!(!reaper.is_expired(&clock));
    }
}
