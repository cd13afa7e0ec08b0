//! Partitioned inflight range locking (SPEC_FULL.md §4.2.5).
//!
//! A fixed number of hash partitions, each a list of `(l_start, l_end)`
//! ranges under its own mutex. `lock` fails immediately on overlap; callers
//! decide whether to requeue (writes) or spin-yield (discard/GC).

use spin::Mutex;

pub const NR_PARTITIONS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, len: u64) -> Self {
        Range { start, end: start + len }
    }

    fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }
}

pub struct InflightSet {
    partitions: Vec<Mutex<Vec<Range>>>,
}

impl InflightSet {
    pub fn new() -> Self {
        InflightSet { partitions: (0..NR_PARTITIONS).map(|_| Mutex::new(Vec::new())).collect() }
    }

    fn partition_of(&self, range: &Range) -> usize {
        (range.start as usize) % self.partitions.len()
    }

    /// Tries to acquire `range`. Fails if it overlaps an already-locked
    /// range in the same partition.
    pub fn try_lock(&self, range: Range) -> bool {
        let idx = self.partition_of(&range);
        let mut held = self.partitions[idx].lock();
        if held.iter().any(|r| r.overlaps(&range)) {
            return false;
        }
        held.push(range);
        true
    }

    pub fn unlock(&self, range: Range) {
        let idx = self.partition_of(&range);
        let mut held = self.partitions[idx].lock();
        if let Some(pos) = held.iter().position(|r| *r == range) {
            held.remove(pos);
        }
    }

    /// Spins, yielding between attempts, until `range` can be locked. Used
    /// by discard and GC's `move_valid_pages`, which must not give up.
    pub fn lock_blocking(&self, range: Range) {
        while !self.try_lock(range) {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_ranges_conflict() {
        let set = InflightSet::new();
        assert!(set.try_lock(Range::new(10, 5)));
        assert!(!set.try_lock(Range::new(12, 5)));
        set.unlock(Range::new(10, 5));
        assert!(set.try_lock(Range::new(12, 5)));
    }

    #[test]
    fn disjoint_ranges_do_not_conflict() {
        let set = InflightSet::new();
        assert!(set.try_lock(Range::new(0, 5)));
        assert!(set.try_lock(Range::new(5, 5)));
    }

    #[test]
    fn lock_blocking_waits_for_release() {
        use std::sync::Arc;
        use std::time::Duration;

        let set = Arc::new(InflightSet::new());
        let range = Range::new(100, 1);
        assert!(set.try_lock(range));

        let set2 = Arc::clone(&set);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            set2.unlock(range);
        });

        set.lock_blocking(range);
        handle.join().unwrap();
    }
}
