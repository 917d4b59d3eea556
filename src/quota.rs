//! Daily answer quota backed by the key-value cache.
//!
//! Each day (in the schedule's UTC offset) gets its own counter key with a
//! two-day TTL, so counts reset at local midnight without a sweeper.

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;

use crate::cache::{keys, KeyValueCache};

const COUNTER_TTL_SECS: u64 = 2 * 24 * 3600;

/// Outcome of [`QuotaCounter::try_consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed { used: u64 },
    Exhausted { limit: u64 },
}

pub struct QuotaCounter {
    cache: Arc<dyn KeyValueCache>,
    daily_limit: u64,
    offset: FixedOffset,
}

impl QuotaCounter {
    /// `daily_limit == 0` disables the quota.
    pub fn new(cache: Arc<dyn KeyValueCache>, daily_limit: u64, offset: FixedOffset) -> Self {
        Self {
            cache,
            daily_limit,
            offset,
        }
    }

    fn day_key(&self, now: DateTime<Utc>) -> String {
        keys::quota(&now.with_timezone(&self.offset).format("%Y-%m-%d").to_string())
    }

    /// Atomically takes one unit for the day containing `now`.
    pub async fn try_consume(&self, now: DateTime<Utc>) -> Result<QuotaDecision> {
        if self.daily_limit == 0 {
            return Ok(QuotaDecision::Allowed { used: 0 });
        }
        let used = self
            .cache
            .increment(&self.day_key(now), 1, COUNTER_TTL_SECS)
            .await?;
        if used as u64 > self.daily_limit {
            return Ok(QuotaDecision::Exhausted {
                limit: self.daily_limit,
            });
        }
        Ok(QuotaDecision::Allowed { used: used as u64 })
    }

    /// Units used so far on the day containing `now`.
    #[cfg(test)]
    async fn used(&self, now: DateTime<Utc>) -> Result<u64> {
        let raw = self.cache.get(&self.day_key(now)).await?;
        Ok(raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0))
    }
}
