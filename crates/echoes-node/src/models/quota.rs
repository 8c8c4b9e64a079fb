//! Quota records - per-identifier daily consumption.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Persisted consumption of one identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRecord {
    /// `user:...` or `anon:...`
    pub identifier: String,

    /// First consumption of the current window
    pub window_start: DateTime<Utc>,

    /// Messages accepted in the window
    pub count: u32,

    /// Whether the identifier was authenticated when last charged
    pub is_authenticated: bool,
}

impl RateLimitRecord {
    /// Whether the window has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.window_start > window
    }

    /// Consumption that still counts at `now`.
    pub fn effective_count(&self, now: DateTime<Utc>, window: Duration) -> u32 {
        if self.is_expired(now, window) {
            0
        } else {
            self.count
        }
    }

    /// When the window resets.
    pub fn reset_at(&self, window: Duration) -> DateTime<Utc> {
        self.window_start + window
    }
}

/// A quota charge to apply atomically with a message append.
///
/// The store re-reads the record under its lock and applies [`QuotaClaim::charge`],
/// so the ceiling holds no matter how many submissions race for the last slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaClaim {
    /// Identifier being charged
    pub identifier: String,

    /// Whether the caller is authenticated
    pub is_authenticated: bool,

    /// Ceiling for the window
    pub limit: u32,

    /// Window length
    pub window: Duration,
}

impl QuotaClaim {
    /// Charge one message against `existing`.
    ///
    /// Returns the updated record, or the reset time when the ceiling is reached.
    pub fn charge(
        &self,
        existing: Option<RateLimitRecord>,
        now: DateTime<Utc>,
    ) -> Result<RateLimitRecord, DateTime<Utc>> {
        match existing {
            Some(record) if !record.is_expired(now, self.window) => {
                if record.count >= self.limit {
                    return Err(record.reset_at(self.window));
                }
                Ok(RateLimitRecord {
                    count: record.count + 1,
                    is_authenticated: self.is_authenticated,
                    ..record
                })
            }
            _ if self.limit == 0 => Err(now + self.window),
            _ => Ok(RateLimitRecord {
                identifier: self.identifier.clone(),
                window_start: now,
                count: 1,
                is_authenticated: self.is_authenticated,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn claim(limit: u32) -> QuotaClaim {
        QuotaClaim {
            identifier: "anon:abc".into(),
            is_authenticated: false,
            limit,
            window: Duration::hours(24),
        }
    }

    #[test]
    fn first_charge_opens_window() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap();
        let record = claim(1).charge(None, now).unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.window_start, now);
        assert_eq!(record.reset_at(Duration::hours(24)), now + Duration::hours(24));
    }

    #[test]
    fn ceiling_is_enforced_until_reset() {
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap();
        let c = claim(2);
        let first = c.charge(None, now).unwrap();
        let second = c.charge(Some(first), now + Duration::minutes(5)).unwrap();
        assert_eq!(second.count, 2);

        let denied = c.charge(Some(second.clone()), now + Duration::hours(23));
        assert_eq!(denied, Err(now + Duration::hours(24)));

        // exactly at the reset instant the window is still open
        assert!(c.charge(Some(second.clone()), now + Duration::hours(24)).is_err());

        let renewed = c
            .charge(Some(second), now + Duration::hours(24) + Duration::seconds(1))
            .unwrap();
        assert_eq!(renewed.count, 1);
    }

    #[test]
    fn zero_limit_never_admits() {
        let now = Utc::now();
        assert!(claim(0).charge(None, now).is_err());
    }
}
