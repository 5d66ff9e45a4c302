//! Expiry policy and clock.
//!
//! Expiry is a pure decision over `(cached_at, expires_at, now)`. Expired
//! records stay in storage until maintenance removes them.

use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::record::CacheRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Expired,
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

/// The freshness window is `[cached_at, expires_at)`: a record whose
/// `expires_at` equals `now` is already expired. A window that ends before
/// it starts is malformed and reads as expired.
pub fn classify(
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Freshness {
    if expires_at < cached_at || now >= expires_at {
        Freshness::Expired
    } else {
        Freshness::Fresh
    }
}

pub fn status(record: &CacheRecord, now: DateTime<Utc>) -> Freshness {
    classify(record.cached_at, record.expires_at, now)
}

/// End of a freshness window of `ttl` starting at `start`. Saturates at the
/// latest representable instant instead of overflowing.
pub fn window_end(start: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    start
        .checked_add_signed(ttl.max(Duration::zero()))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time left before the record expires, zero once expired.
pub fn remaining(record: &CacheRecord, now: DateTime<Utc>) -> Duration {
    (record.expires_at - now).max(Duration::zero())
}

// ============================================================================
// Clock
// ============================================================================

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Content;

    #[test]
    fn test_boundary_is_exclusive() {
        let t = Utc::now();
        let expires = t + Duration::hours(24);
        assert_eq!(classify(t, expires, expires - Duration::milliseconds(1)), Freshness::Fresh);
        assert_eq!(classify(t, expires, expires), Freshness::Expired);
        assert_eq!(classify(t, expires, expires + Duration::minutes(1)), Freshness::Expired);
    }

    #[test]
    fn test_window_end_saturates() {
        let t = Utc::now();
        assert_eq!(window_end(t, Duration::hours(1)), t + Duration::hours(1));
        assert_eq!(window_end(t, Duration::hours(-1)), t);
        assert_eq!(window_end(t, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_malformed_window_is_expired() {
        let t = Utc::now();
        assert_eq!(classify(t, t - Duration::seconds(1), t - Duration::hours(1)), Freshness::Expired);
    }

    #[test]
    fn test_zero_ttl_is_expired_immediately() {
        let t = Utc::now();
        assert_eq!(classify(t, t, t), Freshness::Expired);
    }

    #[test]
    fn test_remaining() {
        let t = Utc::now();
        let rec = CacheRecord::new("x", None, Content::Text("v".into()), Duration::hours(1), t, "tab");
        assert_eq!(remaining(&rec, t), Duration::hours(1));
        assert_eq!(remaining(&rec, t + Duration::hours(2)), Duration::zero());
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
