//! Hybrid-logical timestamps and the clock used to stamp offline writes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// MVCC version timestamp: wall-clock nanoseconds plus a logical counter.
///
/// The zero timestamp marks unversioned (inline or metadata) entries.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall_time: u64,
    #[serde(default)]
    pub logical: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        wall_time: 0,
        logical: 0,
    };
    pub const MAX: Timestamp = Timestamp {
        wall_time: u64::MAX,
        logical: u32::MAX,
    };

    pub const fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::ZERO
    }

    /// Whole seconds of the wall component.
    pub fn wall_secs(&self) -> i64 {
        (self.wall_time / NANOS_PER_SEC) as i64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:09},{}",
            self.wall_time / NANOS_PER_SEC,
            self.wall_time % NANOS_PER_SEC,
            self.logical
        )
    }
}

enum WallSource {
    System,
    Manual(AtomicU64),
}

/// Monotonic hybrid-logical clock.
///
/// Successive calls to [`HlcClock::now`] never return the same or a smaller
/// timestamp, even when the wall source stalls or moves backwards.
pub struct HlcClock {
    source: WallSource,
    last: Mutex<Timestamp>,
}

impl HlcClock {
    pub fn system() -> Self {
        Self {
            source: WallSource::System,
            last: Mutex::new(Timestamp::ZERO),
        }
    }

    /// Clock whose wall component only moves through [`HlcClock::set_wall`].
    pub fn manual(wall_time: u64) -> Self {
        Self {
            source: WallSource::Manual(AtomicU64::new(wall_time)),
            last: Mutex::new(Timestamp::ZERO),
        }
    }

    pub fn set_wall(&self, wall_time: u64) {
        if let WallSource::Manual(wall) = &self.source {
            wall.store(wall_time, Ordering::Relaxed);
        }
    }

    pub fn now(&self) -> Timestamp {
        let wall = self.physical_now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if wall > last.wall_time {
            *last = Timestamp::new(wall, 0);
        } else {
            last.logical = last.logical.saturating_add(1);
        }
        *last
    }

    /// Ratchet the clock past an observed timestamp so the next
    /// [`HlcClock::now`] is strictly greater than it.
    pub fn update(&self, observed: Timestamp) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if observed > *last {
            *last = observed;
        }
    }

    fn physical_now(&self) -> u64 {
        match &self.source {
            WallSource::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos().min(u128::from(u64::MAX)) as u64)
                .unwrap_or_default(),
            WallSource::Manual(wall) => wall.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_ticks_logical_when_wall_stalls() {
        let clock = HlcClock::manual(100);
        let a = clock.now();
        let b = clock.now();
        assert_eq!(a, Timestamp::new(100, 0));
        assert_eq!(b, Timestamp::new(100, 1));

        clock.set_wall(50);
        assert!(clock.now() > b, "clock must not move backwards");

        clock.set_wall(200);
        assert_eq!(clock.now(), Timestamp::new(200, 0));
    }

    #[test]
    fn update_moves_clock_past_observed_timestamp() {
        let clock = HlcClock::manual(100);
        let observed = Timestamp::new(500, 7);
        clock.update(observed);
        assert_eq!(clock.now(), Timestamp::new(500, 8));

        clock.update(Timestamp::new(10, 0));
        assert_eq!(clock.now(), Timestamp::new(500, 9));

        clock.set_wall(600);
        assert_eq!(clock.now(), Timestamp::new(600, 0));
    }

    #[test]
    fn timestamp_display_splits_seconds() {
        let ts = Timestamp::new(1_521_140_384_514_565_824, 3);
        assert_eq!(ts.to_string(), "1521140384.514565824,3");
        assert_eq!(ts.wall_secs(), 1_521_140_384);
    }
}
