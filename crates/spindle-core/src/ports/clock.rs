//! Clock port - 時刻の抽象化
//!
//! Event ordering uses a monotonic `Timestamp`; identifiers use wall-clock
//! time. Both come from the same `Clock` so tests can pin them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic point in time, in nanoseconds since the clock's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Clock は現在時刻を提供
///
/// # テスト容易性
/// - trait により時刻を差し替え可能
/// - テストでは ManualClock を使用
pub trait Clock: Send + Sync {
    /// Monotonic time used to order attempts and events.
    fn now(&self) -> Timestamp;

    /// Wall-clock time used for identifiers and status views.
    fn wall_now(&self) -> DateTime<Utc>;
}

/// 本番用の Clock
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        // u64 nanoseconds cover ~584 years of uptime
        Timestamp(self.origin.elapsed().as_nanos() as u64)
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// テスト用: 手動で進める Clock
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicU64,
    wall: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(start: Timestamp, wall: DateTime<Utc>) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos()),
            wall,
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.nanos.store(at.as_nanos(), Ordering::SeqCst);
    }

    pub fn advance(&self, nanos: u64) -> Timestamp {
        Timestamp(self.nanos.fetch_add(nanos, Ordering::SeqCst) + nanos)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.nanos.load(Ordering::SeqCst))
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.wall
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        (**self).wall_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(a <= b);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let wall = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(Timestamp::from_nanos(100), wall);
        assert_eq!(clock.now(), Timestamp::from_nanos(100));

        assert_eq!(clock.advance(5), Timestamp::from_nanos(105));
        clock.set(Timestamp::from_nanos(7));
        assert_eq!(clock.now(), Timestamp::from_nanos(7));
        assert_eq!(clock.wall_now(), wall);
    }
}
