//! Per-identity daily quotas.
//!
//! The limiter only peeks: it tells the caller whether a submission can
//! proceed and hands back a [`QuotaClaim`]. The charge itself happens inside
//! the store's append transaction, so a failed write consumes nothing and
//! concurrent submissions cannot overshoot the ceiling.

use crate::clock::Clock;
use crate::error::Result;
use crate::identity::Identity;
use crate::models::QuotaClaim;
use crate::storage::Store;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Quota tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaPolicy {
    /// Messages per window for anonymous callers
    pub anonymous_limit: u32,

    /// Messages per window for authenticated callers
    pub authenticated_limit: u32,

    /// Window length, counted from the first message
    pub window: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            anonymous_limit: 1,
            authenticated_limit: 5,
            window: Duration::hours(24),
        }
    }
}

impl QuotaPolicy {
    /// Ceiling for an identity, `None` when unlimited.
    pub fn limit_for(&self, identity: &Identity) -> Option<u32> {
        if identity.is_privileged {
            None
        } else if identity.is_authenticated {
            Some(self.authenticated_limit)
        } else {
            Some(self.anonymous_limit)
        }
    }
}

/// Outcome of [`RateLimiter::check_and_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Proceed. `claim` is `None` for unlimited identities.
    Allowed {
        remaining: Option<u32>,
        claim: Option<QuotaClaim>,
    },
    /// The window is used up.
    Denied { reset_at: DateTime<Utc> },
}

/// Read-only view of an identity's quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    /// `None` when unlimited
    pub limit: Option<u32>,

    /// `None` when unlimited
    pub remaining: Option<u32>,

    /// When the current window ends, if one is open
    pub reset_at: Option<DateTime<Utc>>,

    pub is_authenticated: bool,
}

/// Daily quota checks backed by the store.
pub struct RateLimiter {
    policy: QuotaPolicy,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(policy: QuotaPolicy, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            store,
            clock,
        }
    }

    /// Decide whether `identity` may submit now.
    pub fn check_and_reserve(&self, identity: &Identity) -> Result<QuotaDecision> {
        let Some(limit) = self.policy.limit_for(identity) else {
            return Ok(QuotaDecision::Allowed {
                remaining: None,
                claim: None,
            });
        };

        let now = self.clock.now();
        let claim = QuotaClaim {
            identifier: identity.identifier.clone(),
            is_authenticated: identity.is_authenticated,
            limit,
            window: self.policy.window,
        };
        let existing = self.store.rate_limit(&identity.identifier)?;
        match claim.charge(existing, now) {
            Ok(after) => Ok(QuotaDecision::Allowed {
                remaining: Some(limit.saturating_sub(after.count)),
                claim: Some(claim),
            }),
            Err(reset_at) => Ok(QuotaDecision::Denied { reset_at }),
        }
    }

    /// Current quota of `identity` without consuming anything.
    pub fn remaining(&self, identity: &Identity) -> Result<QuotaStatus> {
        let Some(limit) = self.policy.limit_for(identity) else {
            return Ok(QuotaStatus {
                limit: None,
                remaining: None,
                reset_at: None,
                is_authenticated: identity.is_authenticated,
            });
        };

        let now = self.clock.now();
        let record = self
            .store
            .rate_limit(&identity.identifier)?
            .filter(|record| !record.is_expired(now, self.policy.window));
        let used = record.as_ref().map_or(0, |record| record.count);
        Ok(QuotaStatus {
            limit: Some(limit),
            remaining: Some(limit.saturating_sub(used)),
            reset_at: record.map(|record| record.reset_at(self.policy.window)),
            is_authenticated: identity.is_authenticated,
        })
    }

    /// Seconds from now until `reset_at`, at least 1.
    pub fn seconds_until(&self, reset_at: DateTime<Utc>) -> u64 {
        (reset_at - self.clock.now()).num_seconds().max(1) as u64
    }
}
