//! Per-block state: the append cursor, the invalid-page bitmap, and the
//! atomic write-completion counter that feeds GC priority-list population
//! (SPEC_FULL.md §3, §4.2.6).

use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::bitmap::Bitmap;

/// Stable index into the Block Manager's block arena. Never an owning
/// handle — blocks live in the arena for the lifetime of the device
/// (design note §9: "express as stable indices, not owning handles").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);

impl From<BlockId> for usize {
    fn from(id: BlockId) -> usize {
        id.0
    }
}

struct BlockInner {
    invalid_pages: Bitmap,
    nr_invalid_pages: u32,
    next_page: u32,
}

/// A single erase-block: the unit of erase, holding `nr_pages_per_block`
/// pages. Guarded by its own lock for the bitmap and cursors; list
/// membership (Free/InUse/Bad) is guarded by the owning LUN's lock.
pub struct Block {
    pub id: BlockId,
    pub lun_id: usize,
    nr_pages_per_block: u32,
    inner: Mutex<BlockInner>,
    /// Count of writes that have completed into this block. Incremented by
    /// the write-completion handler; not protected by `inner` because it is
    /// read/written by a different actor (I/O completion vs. the owning
    /// write path) and only ever needs atomic fetch-add semantics.
    pub data_committed_count: AtomicU32,
}

impl Block {
    pub fn new(id: BlockId, lun_id: usize, nr_pages_per_block: u32) -> Self {
        Block {
            id,
            lun_id,
            nr_pages_per_block,
            inner: Mutex::new(BlockInner {
                invalid_pages: Bitmap::new(nr_pages_per_block as usize),
                nr_invalid_pages: 0,
                next_page: 0,
            }),
            data_committed_count: AtomicU32::new(0),
        }
    }

    /// Reset cursor, bitmap, and commit count at (re)allocation time. The
    /// bitmap is deliberately *not* cleared in `put_block` — only here, at
    /// the next `get_block` (§4.1).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.invalid_pages.clear();
        inner.nr_invalid_pages = 0;
        inner.next_page = 0;
        self.data_committed_count.store(0, Ordering::Release);
    }

    /// Reserve the next page slot for a write, post-incrementing the cursor.
    /// Returns `None` if the block is full.
    pub fn reserve_next_page(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        if inner.next_page >= self.nr_pages_per_block {
            return None;
        }
        let slot = inner.next_page;
        inner.next_page += 1;
        Some(slot)
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.next_page >= self.nr_pages_per_block
    }

    pub fn next_page(&self) -> u32 {
        self.inner.lock().next_page
    }

    /// Marks `slot` invalid. No-op if already invalid (idempotent, matching
    /// `test_and_set_bit` semantics).
    pub fn invalidate_page(&self, slot: u32) {
        let mut inner = self.inner.lock();
        if inner.invalid_pages.set(slot as usize) {
            inner.nr_invalid_pages += 1;
        }
    }

    pub fn nr_invalid_pages(&self) -> u32 {
        self.inner.lock().nr_invalid_pages
    }

    pub fn nr_pages_per_block(&self) -> u32 {
        self.nr_pages_per_block
    }

    /// True iff every page in the block has been invalidated.
    pub fn invalid_pages_full(&self) -> bool {
        self.inner.lock().invalid_pages.is_full()
    }

    /// Lowest-to-highest slots that are *not yet* invalid, for GC's
    /// `move_valid_pages` scan (§4.2.6). Snapshots under the block lock so
    /// the caller sees a consistent bitmap even though it later races with
    /// concurrent invalidation while walking the result.
    pub fn valid_slots(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        inner.invalid_pages.iter_zeros().map(|i| i as u32).collect()
    }

    /// Invariant check used by property tests (§8.1): `popcount == nr_invalid_pages`.
    #[cfg(test)]
    pub fn check_invariant(&self) -> bool {
        let inner = self.inner.lock();
        inner.invalid_pages.popcount() == inner.nr_invalid_pages
    }
}
