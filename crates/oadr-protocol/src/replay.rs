//! Timestamp/nonce cache guarding against replayed signed messages.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{elapsed, now, sub_duration};

/// Default maximum age of a signature.
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("message was signed too long ago ({age_ms} ms, allowed {max_ms} ms)")]
    SignedTooLongAgo { age_ms: u128, max_ms: u128 },

    #[error("timestamp and nonce were already used")]
    AlreadyUsed,
}

/// Set of recently seen `(timestamp, nonce)` pairs.
///
/// Every accepted pair sweeps out entries older than `max_skew` from now,
/// so the set stays as small as the traffic inside one window.
#[derive(Debug)]
pub struct ReplayCache {
    seen: HashSet<(DateTime<Utc>, String)>,
    max_skew: Duration,
}

impl ReplayCache {
    pub fn new(max_skew: Duration) -> Self {
        Self {
            seen: HashSet::new(),
            max_skew,
        }
    }

    pub fn max_skew(&self) -> Duration {
        self.max_skew
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn verify(&mut self, timestamp: DateTime<Utc>, nonce: &str) -> Result<(), ReplayError> {
        self.verify_at(timestamp, nonce, now())
    }

    /// [`verify`](Self::verify) against an explicit clock.
    pub fn verify_at(
        &mut self,
        timestamp: DateTime<Utc>,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ReplayError> {
        let age = elapsed(timestamp, now);
        if age > self.max_skew {
            return Err(ReplayError::SignedTooLongAgo {
                age_ms: age.as_millis(),
                max_ms: self.max_skew.as_millis(),
            });
        }

        let key = (timestamp, nonce.to_string());
        if self.seen.contains(&key) {
            return Err(ReplayError::AlreadyUsed);
        }
        self.seen.insert(key);

        let horizon = sub_duration(now, self.max_skew);
        self.seen.retain(|(ts, _)| *ts >= horizon);
        Ok(())
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SKEW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn fresh_pair_is_accepted_once() {
        let mut cache = ReplayCache::default();
        assert!(cache.verify_at(at(0), "n1", at(100)).is_ok());
        assert_eq!(
            cache.verify_at(at(0), "n1", at(200)),
            Err(ReplayError::AlreadyUsed)
        );
    }

    #[test]
    fn same_nonce_with_new_timestamp_is_fine() {
        let mut cache = ReplayCache::default();
        cache.verify_at(at(0), "n1", at(0)).unwrap();
        cache.verify_at(at(1), "n1", at(1)).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn stale_signature_is_rejected_even_with_new_nonce() {
        let mut cache = ReplayCache::default();
        let err = cache.verify_at(at(0), "fresh", at(5_001)).unwrap_err();
        assert_eq!(
            err,
            ReplayError::SignedTooLongAgo {
                age_ms: 5_001,
                max_ms: 5_000
            }
        );
        // Exactly at the skew boundary is still fine.
        assert!(cache.verify_at(at(0), "fresh", at(5_000)).is_ok());
    }

    #[test]
    fn old_entries_are_swept_relative_to_now() {
        let mut cache = ReplayCache::new(Duration::from_secs(5));
        cache.verify_at(at(0), "a", at(0)).unwrap();
        cache.verify_at(at(1_000), "b", at(1_000)).unwrap();
        assert_eq!(cache.len(), 2);

        cache.verify_at(at(5_500), "c", at(5_500)).unwrap();
        // "a" is older than now - 5s, "b" is not.
        assert_eq!(cache.len(), 2);
    }
}
