//! Logical↔physical address maps (SPEC_FULL.md §3, §4.2.2).
//!
//! `trans_map` and `rev_map` are always updated together under the same
//! lock; `AddrMap` bundles them so that invariant is structural rather than
//! a convention callers have to remember.

use spin::Mutex;

use crate::block_manager::block::BlockId;

pub const EMPTY: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransEntry {
    pub addr: u64,
    pub block: Option<BlockId>,
}

impl TransEntry {
    const fn empty() -> Self {
        TransEntry { addr: EMPTY, block: None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RevEntry {
    pub addr: u64,
}

impl RevEntry {
    const fn empty() -> Self {
        RevEntry { addr: EMPTY }
    }
}

struct Inner {
    trans_map: Vec<TransEntry>,
    rev_map: Vec<RevEntry>,
}

/// Both maps, guarded by one lock (the "reverse-map lock", §5) since every
/// update touches both and must appear atomic to readers.
pub struct AddrMap {
    poffset: u64,
    inner: Mutex<Inner>,
}

impl AddrMap {
    pub fn new(nr_pages: usize, poffset: u64) -> Self {
        AddrMap {
            poffset,
            inner: Mutex::new(Inner {
                trans_map: vec![TransEntry::empty(); nr_pages],
                rev_map: vec![RevEntry::empty(); nr_pages],
            }),
        }
    }

    pub fn lookup(&self, logical: u64) -> TransEntry {
        self.inner.lock().trans_map[logical as usize]
    }

    pub fn rev_lookup(&self, physical: u64) -> RevEntry {
        self.inner.lock().rev_map[(physical - self.poffset) as usize]
    }

    /// Installs `logical -> (block, new_phys)`, invalidating whatever the
    /// old mapping pointed to. Returns the old mapping's physical address,
    /// if any, so the caller can invalidate the page on its owning block
    /// (§4.2.2 step 5) without holding this lock during that call.
    pub fn update(&self, logical: u64, block: BlockId, new_phys: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        let old = inner.trans_map[logical as usize];
        if old.block.is_some() {
            let old_idx = (old.addr - self.poffset) as usize;
            inner.rev_map[old_idx] = RevEntry::empty();
        }
        inner.trans_map[logical as usize] = TransEntry { addr: new_phys, block: Some(block) };
        inner.rev_map[(new_phys - self.poffset) as usize] = RevEntry { addr: logical };
        old.block.map(|_| old.addr)
    }

    /// Clears `logical`'s mapping (discard path, §4.2.4). Returns the
    /// physical address that was mapped, if any.
    pub fn clear(&self, logical: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        let old = inner.trans_map[logical as usize];
        if old.block.is_none() {
            return None;
        }
        let old_idx = (old.addr - self.poffset) as usize;
        inner.rev_map[old_idx] = RevEntry::empty();
        inner.trans_map[logical as usize] = TransEntry::empty();
        Some(old.addr)
    }

    #[cfg(test)]
    pub fn check_invariant(&self) -> bool {
        let inner = self.inner.lock();
        for (logical, entry) in inner.trans_map.iter().enumerate() {
            if let Some(_) = entry.block {
                let idx = (entry.addr - self.poffset) as usize;
                if inner.rev_map[idx].addr != logical as u64 {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_lookup_round_trips() {
        let map = AddrMap::new(16, 0);
        let old = map.update(3, BlockId(0), 7);
        assert_eq!(old, None);
        assert_eq!(map.lookup(3).addr, 7);
        assert_eq!(map.rev_lookup(7).addr, 3);
        assert!(map.check_invariant());
    }

    #[test]
    fn remap_invalidates_old_physical_and_rev_entry() {
        let map = AddrMap::new(16, 0);
        map.update(3, BlockId(0), 7);
        let old = map.update(3, BlockId(1), 9);
        assert_eq!(old, Some(7));
        assert_eq!(map.rev_lookup(7).addr, EMPTY);
        assert_eq!(map.lookup(3).addr, 9);
        assert!(map.check_invariant());
    }

    #[test]
    fn clear_removes_both_sides() {
        let map = AddrMap::new(16, 0);
        map.update(3, BlockId(0), 7);
        let old = map.clear(3);
        assert_eq!(old, Some(7));
        assert_eq!(map.lookup(3).block, None);
        assert_eq!(map.rev_lookup(7).addr, EMPTY);
    }
}
