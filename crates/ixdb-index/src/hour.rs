//! Hourly active-set tracker
//!
//! Remembers which metric ids received samples in the current and the
//! previous hour. A hit means the per-day rows for that hour's date already
//! exist, so the registrar can skip the store entirely.

use ixdb_core::MetricId;
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use tracing::debug;

const HOURS_PER_DAY: u64 = 24;

#[derive(Debug, Default)]
struct HourSet {
    hour: u64,
    ids: RoaringTreemap,
}

impl HourSet {
    fn empty(hour: u64) -> Self {
        Self {
            hour,
            ids: RoaringTreemap::new(),
        }
    }

    fn date(&self) -> u64 {
        self.hour / HOURS_PER_DAY
    }
}

#[derive(Debug)]
struct Sets {
    current: HourSet,
    previous: HourSet,
}

/// Tracker statistics
#[derive(Debug, Clone, Default)]
pub struct HourStats {
    pub current_hour: u64,
    pub current_len: u64,
    pub previous_len: u64,
}

/// Current and previous hour sets of active metric ids
#[derive(Debug)]
pub struct HourTracker {
    sets: RwLock<Sets>,
}

impl HourTracker {
    /// Create a tracker positioned at `hour`
    pub fn new(hour: u64) -> Self {
        Self {
            sets: RwLock::new(Sets {
                current: HourSet::empty(hour),
                previous: HourSet::empty(hour.saturating_sub(1)),
            }),
        }
    }

    /// Advance to `hour` if it is newer than the current one.
    ///
    /// Returns true when a rotation happened. Skipping more than one hour
    /// clears the previous set as well.
    pub fn rotate_if_needed(&self, hour: u64) -> bool {
        if hour <= self.sets.read().current.hour {
            return false;
        }

        let mut sets = self.sets.write();
        if hour <= sets.current.hour {
            return false;
        }
        let old = std::mem::replace(&mut sets.current, HourSet::empty(hour));
        sets.previous = if old.hour + 1 == hour {
            old
        } else {
            HourSet::empty(hour - 1)
        };
        debug!(
            "Rotated hourly active set to hour {}, previous holds {} ids",
            hour,
            sets.previous.ids.len()
        );
        true
    }

    /// Record `id` as active in `hour`.
    ///
    /// Hours older than the previous one are not tracked; returns whether the
    /// id was recorded.
    pub fn add(&self, id: MetricId, hour: u64) -> bool {
        self.rotate_if_needed(hour);

        {
            let sets = self.sets.read();
            let set = if sets.current.hour == hour {
                &sets.current
            } else if sets.previous.hour == hour {
                &sets.previous
            } else {
                return false;
            };
            if set.ids.contains(id) {
                return true;
            }
        }

        let mut sets = self.sets.write();
        if sets.current.hour == hour {
            sets.current.ids.insert(id);
        } else if sets.previous.hour == hour {
            sets.previous.ids.insert(id);
        } else {
            return false;
        }
        true
    }

    /// Check whether `id` was seen in the current or the previous hour
    pub fn is_known_active(&self, id: MetricId) -> bool {
        let sets = self.sets.read();
        sets.current.ids.contains(id) || sets.previous.ids.contains(id)
    }

    /// Check whether `id` was seen in a tracked hour belonging to `date`
    pub fn contains_for_date(&self, id: MetricId, date: u64) -> bool {
        let sets = self.sets.read();
        (sets.current.date() == date && sets.current.ids.contains(id))
            || (sets.previous.date() == date && sets.previous.ids.contains(id))
    }

    /// Replace the current set with `ids` at `hour` and clear the previous one
    pub fn rebuild(&self, hour: u64, ids: RoaringTreemap) {
        let mut sets = self.sets.write();
        sets.current = HourSet { hour, ids };
        sets.previous = HourSet::empty(hour.saturating_sub(1));
    }

    /// Get tracker statistics
    pub fn stats(&self) -> HourStats {
        let sets = self.sets.read();
        HourStats {
            current_hour: sets.current.hour,
            current_len: sets.current.ids.len(),
            previous_len: sets.previous.ids.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let tracker = HourTracker::new(100);
        assert!(tracker.add(7, 100));
        assert!(tracker.is_known_active(7));
        assert!(!tracker.is_known_active(8));
        assert!(tracker.contains_for_date(7, 100 / 24));
        assert!(!tracker.contains_for_date(7, 100 / 24 + 1));
    }

    #[test]
    fn test_rotation_moves_current_to_previous() {
        let tracker = HourTracker::new(100);
        tracker.add(1, 100);

        assert!(tracker.rotate_if_needed(101));
        assert!(tracker.is_known_active(1));
        tracker.add(2, 101);

        assert!(tracker.rotate_if_needed(102));
        assert!(!tracker.is_known_active(1));
        assert!(tracker.is_known_active(2));
    }

    #[test]
    fn test_gap_clears_both_sets() {
        let tracker = HourTracker::new(100);
        tracker.add(1, 100);
        assert!(tracker.rotate_if_needed(105));
        assert!(!tracker.is_known_active(1));
        assert_eq!(tracker.stats().previous_len, 0);
    }

    #[test]
    fn test_old_hours_are_ignored() {
        let tracker = HourTracker::new(100);
        assert!(!tracker.rotate_if_needed(90));
        assert!(tracker.add(3, 99));
        assert!(!tracker.add(4, 50));
        assert!(!tracker.is_known_active(4));
        assert_eq!(tracker.stats().current_hour, 100);
    }

    #[test]
    fn test_rebuild() {
        let tracker = HourTracker::new(10);
        let mut ids = RoaringTreemap::new();
        ids.insert(42);
        tracker.rebuild(48, ids);
        assert!(tracker.contains_for_date(42, 2));
        assert_eq!(tracker.stats().current_hour, 48);
    }
}
