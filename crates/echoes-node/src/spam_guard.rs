//! Short-window abuse detection.
//!
//! Counts attempts per identifier in a fixed window and blocks identifiers
//! that exceed the limit. State is in-process only and lost on restart.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Records beyond this count trigger a sweep of expired entries.
const PRUNE_THRESHOLD: usize = 10_000;

/// Spam guard tuning.
#[derive(Debug, Clone)]
pub struct SpamGuardConfig {
    /// Attempts allowed per window
    pub max_attempts: u32,

    /// Window length
    pub window: Duration,

    /// Block length once the limit is exceeded
    pub block: Duration,
}

impl Default for SpamGuardConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window: Duration::minutes(1),
            block: Duration::hours(1),
        }
    }
}

/// Verdict for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Blocked { until: DateTime<Utc> },
}

#[derive(Debug, Clone)]
struct SpamWindowRecord {
    attempts: u32,
    window_start: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

impl SpamWindowRecord {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            attempts: 0,
            window_start: now,
            blocked_until: None,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.blocked_until {
            Some(until) => now >= until,
            None => now - self.window_start > window,
        }
    }
}

/// In-memory burst detector.
pub struct SpamGuard {
    config: SpamGuardConfig,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, SpamWindowRecord>>,
}

impl SpamGuard {
    pub fn new(config: SpamGuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Count an attempt and decide whether it may proceed.
    pub fn admit(&self, identifier: &str) -> Admission {
        let now = self.clock.now();
        let mut records = self.records.lock();

        if records.len() > PRUNE_THRESHOLD {
            let window = self.config.window;
            records.retain(|_, record| !record.is_stale(now, window));
        }

        let record = records
            .entry(identifier.to_string())
            .or_insert_with(|| SpamWindowRecord::fresh(now));

        if let Some(until) = record.blocked_until {
            if now < until {
                return Admission::Blocked { until };
            }
            *record = SpamWindowRecord::fresh(now);
        }

        if now - record.window_start > self.config.window {
            record.window_start = now;
            record.attempts = 0;
        }

        record.attempts += 1;
        if record.attempts > self.config.max_attempts {
            let until = now + self.config.block;
            record.blocked_until = Some(until);
            tracing::warn!(identifier, %until, "Blocking identifier after burst");
            return Admission::Blocked { until };
        }

        Admission::Allowed
    }

    /// Identifiers currently tracked.
    pub fn tracked(&self) -> usize {
        self.records.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn guard() -> (SpamGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let guard = SpamGuard::new(SpamGuardConfig::default(), clock.clone());
        (guard, clock)
    }

    #[test]
    fn allows_up_to_limit_then_blocks() {
        let (guard, clock) = guard();
        for _ in 0..10 {
            assert_eq!(guard.admit("anon:a"), Admission::Allowed);
        }
        let blocked = guard.admit("anon:a");
        assert_eq!(
            blocked,
            Admission::Blocked {
                until: clock.now() + Duration::hours(1)
            }
        );
        // other identifiers are unaffected
        assert_eq!(guard.admit("anon:b"), Admission::Allowed);
    }

    #[test]
    fn window_rolls_over() {
        let (guard, clock) = guard();
        for _ in 0..10 {
            guard.admit("anon:a");
        }
        clock.advance(Duration::seconds(61));
        assert_eq!(guard.admit("anon:a"), Admission::Allowed);
    }

    #[test]
    fn block_expires() {
        let (guard, clock) = guard();
        for _ in 0..11 {
            guard.admit("anon:a");
        }
        clock.advance(Duration::minutes(59));
        assert!(matches!(guard.admit("anon:a"), Admission::Blocked { .. }));
        clock.advance(Duration::minutes(2));
        assert_eq!(guard.admit("anon:a"), Admission::Allowed);
    }

    #[test]
    fn stale_records_are_pruned() {
        let (guard, clock) = guard();
        for i in 0..=PRUNE_THRESHOLD {
            guard.admit(&format!("anon:{i}"));
        }
        assert_eq!(guard.tracked(), PRUNE_THRESHOLD + 1);

        clock.advance(Duration::minutes(2));
        guard.admit("anon:late");
        assert_eq!(guard.tracked(), 1);
    }
}
