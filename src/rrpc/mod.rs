//! Round-Robin Page FTL: address translation, per-LBA locking, the
//! write-path mapper, and cost-based garbage collection (SPEC_FULL.md §4.2).

pub mod gc;
pub mod inflight;
pub mod map;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use spin::Mutex;

use crate::block_manager::block::BlockId;
use crate::block_manager::BlockManager;
use crate::device::{BioDirection, Rqd};
use crate::error::{FtlError, RqOutcome};
use inflight::{InflightSet, Range};
use map::AddrMap;

/// Host write low-water mark, in free blocks per LUN (§4.2.2 step 2).
const HOST_LOW_WATER_PER_LUN: usize = 4;

/// Per-write-stream headroom per LUN: cur + gc_cur + two emergency blocks
/// (§4.2.7).
const RESERVED_PAGES_PER_LUN_FACTOR: u64 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub block: BlockId,
    pub phys: u64,
}

struct LunShadow {
    cur: Option<BlockId>,
    gc_cur: Option<BlockId>,
    prio_list: VecDeque<BlockId>,
}

impl LunShadow {
    fn new() -> Self {
        LunShadow { cur: None, gc_cur: None, prio_list: VecDeque::new() }
    }
}

/// The FTL instance. Owns the logical/physical maps, the inflight set, and
/// each LUN's append cursors and GC priority list; borrows blocks and LUNs
/// from the `BlockManager` it was built over (§3 "Ownership").
pub struct Rrpc {
    bm: Arc<BlockManager>,
    map: AddrMap,
    inflight: InflightSet,
    shadows: Vec<Mutex<LunShadow>>,
    next_lun: AtomicUsize,
    nr_phy_in_log: u64,
    nr_pages: u64,
    reserved_pages: u64,
    stranded: Mutex<Vec<BlockId>>,
    /// Scratch page buffers for GC's read-then-write cycle, sized at
    /// attach time (§5 "Memory": fixed-size pools, size >= nr_luns).
    gc_buf_pool: ArrayQueue<Vec<u8>>,
    page_bytes: usize,
}

impl Rrpc {
    /// Builds the FTL over an already-attached `BlockManager`. Fails if the
    /// device's own headroom requirement already exceeds its capacity
    /// (§4.2.7).
    pub fn new(bm: Arc<BlockManager>) -> Result<Self, FtlError> {
        let nr_luns = bm.nr_luns();
        let nr_pages = bm.total_pages();
        let max_pages_per_block = (0..nr_luns).map(|l| bm.nr_pages_per_block(l)).max().unwrap_or(0) as u64;
        let reserved_pages = nr_luns as u64 * max_pages_per_block * RESERVED_PAGES_PER_LUN_FACTOR;
        if reserved_pages >= nr_pages {
            return Err(FtlError::CapacityExhausted);
        }
        let g = bm.geometry(0);
        let nr_phy_in_log = (g.granularity_write / g.granularity_read) as u64;
        let page_bytes = g.granularity_write as usize;

        let gc_buf_pool = ArrayQueue::new(nr_luns.max(1));
        for _ in 0..nr_luns.max(1) {
            let _ = gc_buf_pool.push(vec![0u8; page_bytes]);
        }

        Ok(Rrpc {
            map: AddrMap::new(nr_pages as usize, 0),
            inflight: InflightSet::new(),
            shadows: (0..nr_luns).map(|_| Mutex::new(LunShadow::new())).collect(),
            next_lun: AtomicUsize::new(0),
            nr_phy_in_log,
            nr_pages,
            reserved_pages,
            bm,
            stranded: Mutex::new(Vec::new()),
            gc_buf_pool,
            page_bytes,
        })
    }

    /// Exposed host capacity in sectors, 10% overprovisioned for GC (§4.2.7).
    pub fn capacity(&self) -> u64 {
        ((self.nr_pages - self.reserved_pages) / 10) * 9 * self.nr_phy_in_log
    }

    /// Blocks that GC gave up reclaiming mid-way; left in `used` with no
    /// further GC attempt (§9 open question, decision: surfaced not hidden).
    pub fn stranded_blocks(&self) -> Vec<BlockId> {
        self.stranded.lock().clone()
    }

    fn pick_lun(&self, is_gc: bool) -> usize {
        let nr_luns = self.shadows.len();
        if !is_gc {
            self.next_lun.fetch_add(1, Ordering::Relaxed) % nr_luns
        } else {
            (0..nr_luns).max_by_key(|&l| self.bm.lun(l).nr_free_blocks()).expect("at least one LUN")
        }
    }

    fn total_free_blocks(&self) -> usize {
        (0..self.bm.nr_luns()).map(|l| self.bm.lun(l).nr_free_blocks()).sum()
    }

    /// `map_page` (§4.2.2): picks a LUN, reserves a page slot from that
    /// LUN's append cursor (refilling it from the Block Manager if full),
    /// and installs the new mapping.
    pub fn map_page(&self, logical: u64, is_gc: bool) -> Option<Mapping> {
        let lun_id = self.pick_lun(is_gc);
        if !is_gc && self.total_free_blocks() < HOST_LOW_WATER_PER_LUN * self.bm.nr_luns() {
            return None;
        }

        let mut shadow = self.shadows[lun_id].lock();
        if let Some((block_id, slot)) = self.reserve_in_cursor(&mut shadow, lun_id, false) {
            drop(shadow);
            return Some(self.install_mapping(logical, block_id, slot));
        }
        if is_gc {
            if let Some((block_id, slot)) = self.reserve_in_cursor(&mut shadow, lun_id, true) {
                drop(shadow);
                return Some(self.install_mapping(logical, block_id, slot));
            }
        }
        None
    }

    /// Reserves a page from `cur` (or `gc_cur` when `use_gc_cursor`),
    /// refilling it from the Block Manager when full. `bypass_reserved`
    /// lets GC's own fallback ignore the two-block-per-LUN reservation.
    fn reserve_in_cursor(&self, shadow: &mut LunShadow, lun_id: usize, use_gc_cursor: bool) -> Option<(BlockId, u32)> {
        let cursor = if use_gc_cursor { &mut shadow.gc_cur } else { &mut shadow.cur };
        if let Some(id) = *cursor {
            if let Some(slot) = self.bm.block(id).reserve_next_page() {
                return Some((id, slot));
            }
            debug_assert!(self.bm.block(id).is_full(), "cursor only advances once its block is full");
        }
        let fresh = self.bm.get_block(lun_id, use_gc_cursor)?;
        let slot = self.bm.block(fresh).reserve_next_page().expect("freshly reset block always has room");
        *cursor = Some(fresh);
        Some((fresh, slot))
    }

    fn install_mapping(&self, logical: u64, block_id: BlockId, slot: u32) -> Mapping {
        let phys = self.bm.page_for_slot(block_id, slot);
        if let Some(old_phys) = self.map.update(logical, block_id, phys) {
            let (old_block, old_slot) = self.bm.locate_page(old_phys);
            self.bm.block(old_block).invalidate_page(old_slot);
        }
        Mapping { block: block_id, phys }
    }

    /// `read_rq` (§4.2.3): unmapped reads complete immediately; mapped
    /// reads are submitted to the device under the inflight range lock.
    pub fn read_rq(&self, logical: u64, buf: &mut [u8]) -> RqOutcome {
        let range = Range::new(logical, 1);
        if !self.inflight.try_lock(range) {
            return RqOutcome::Requeue;
        }
        let entry = self.map.lookup(logical);
        if entry.block.is_none() {
            self.inflight.unlock(range);
            return RqOutcome::Done;
        }
        let mut rqd = Rqd::new(BioDirection::Read, entry.addr * self.nr_phy_in_log, buf, false);
        let result = self.bm.submit_io(&mut rqd);
        self.inflight.unlock(range);
        match result {
            Ok(()) => RqOutcome::Ok,
            Err(_) => RqOutcome::Err,
        }
    }

    /// `write_rq`: maps the logical page, submits to the device, and runs
    /// the write-completion hook inline (this implementation's device
    /// adapters complete synchronously, §4.3).
    pub fn write_rq(&self, logical: u64, buf: &mut [u8], is_gc: bool) -> RqOutcome {
        let range = Range::new(logical, 1);
        if !is_gc && !self.inflight.try_lock(range) {
            return RqOutcome::Requeue;
        }
        let mapping = match self.map_page(logical, is_gc) {
            Some(m) => m,
            None => {
                if !is_gc {
                    self.inflight.unlock(range);
                    // No free page: kick GC so a future requeue has room.
                    // map_page's own LUN choice isn't threaded back out here,
                    // so every LUN gets a chance rather than just the one
                    // that failed.
                    for lun_id in 0..self.bm.nr_luns() {
                        self.lun_gc(lun_id);
                    }
                }
                return RqOutcome::Requeue;
            }
        };
        let mut rqd = Rqd::new(BioDirection::Write, mapping.phys * self.nr_phy_in_log, buf, is_gc);
        let result = self.bm.submit_io(&mut rqd);
        if !is_gc {
            self.inflight.unlock(range);
        }
        match result {
            Ok(()) => {
                self.end_io_write(mapping.block);
                RqOutcome::Ok
            }
            Err(_) => RqOutcome::Err,
        }
    }

    /// Write-completion hook: bumps the committed-page count and, once a
    /// block is fully written, enqueues it on its LUN's GC priority list
    /// (§4.2.6 "Priority-list population").
    fn end_io_write(&self, block_id: BlockId) {
        let block = self.bm.block(block_id);
        let count = block.data_committed_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count == block.nr_pages_per_block() {
            self.shadows[block.lun_id].lock().prio_list.push_back(block_id);
        }
    }

    /// `discard` (§4.2.4): blocks until the range lock is free, then
    /// invalidates every logical page in range. The physical blocks are not
    /// erased here; GC reclaims them later.
    pub fn discard(&self, logical_start: u64, len: u64) {
        let range = Range::new(logical_start, len);
        self.inflight.lock_blocking(range);
        for logical in logical_start..logical_start + len {
            if let Some(old_phys) = self.map.clear(logical) {
                let (block_id, slot) = self.bm.locate_page(old_phys);
                self.bm.block(block_id).invalidate_page(slot);
            }
        }
        self.inflight.unlock(range);
    }

    /// `make_rq` (§4.2.8): dispatches a single bio to the appropriate path.
    pub fn make_rq(&self, direction: BioDirection, logical: u64, buf: &mut [u8]) -> RqOutcome {
        match direction {
            BioDirection::Discard => {
                self.discard(logical, 1);
                RqOutcome::Done
            }
            BioDirection::Read => self.read_rq(logical, buf),
            BioDirection::Write => self.write_rq(logical, buf, false),
        }
    }

    /// `lun_gc`: selects victims for one LUN and reclaims each in turn
    /// (§4.2.6). A host runtime dispatches this from a periodic timer or a
    /// `workqueue::Workqueue` work item; it runs synchronously here.
    pub fn lun_gc(&self, lun_id: usize) {
        let lun = self.bm.lun(lun_id);
        let need = gc::victims_needed(lun.nr_blocks, self.bm.nr_luns());
        let victims = {
            let mut shadow = self.shadows[lun_id].lock();
            gc::select_victims(
                &mut shadow.prio_list,
                lun.nr_free_blocks(),
                need,
                |id| self.bm.block(id).nr_invalid_pages(),
                |id| self.bm.block(id).is_full(),
            )
        };
        for victim in victims {
            self.block_gc(victim);
        }
    }

    /// `block_gc`: reclaims a single victim block, or strands it in `used`
    /// on failure (§9: stranding is implemented as specified, not silently
    /// fixed, and is surfaced via `stranded_blocks`).
    fn block_gc(&self, block_id: BlockId) {
        match self.move_valid_pages(block_id) {
            Ok(()) => {
                if let Err(e) = self.bm.erase_block(block_id) {
                    log::error!("rrpc: erase failed reclaiming block {}: {e}", block_id.0);
                    self.stranded.lock().push(block_id);
                    return;
                }
                self.bm.put_block(block_id);
            }
            Err(e) => {
                log::error!("rrpc: gc reclamation failed for block {}: {e}", block_id.0);
                self.stranded.lock().push(block_id);
            }
        }
    }

    /// `move_valid_pages` (§4.2.6): reads every still-valid page off the
    /// victim and rewrites it through `map_page`, which naturally
    /// invalidates the old slot as a side effect of `install_mapping`.
    fn move_valid_pages(&self, block_id: BlockId) -> Result<(), FtlError> {
        let block = self.bm.block(block_id);
        if block.invalid_pages_full() {
            return Ok(());
        }

        for slot in block.valid_slots() {
            let phys = self.bm.page_for_slot(block_id, slot);
            loop {
                let rev = self.map.rev_lookup(phys);
                if rev.addr == map::EMPTY {
                    break;
                }
                let logical = rev.addr;
                let range = Range::new(logical, 1);
                self.inflight.lock_blocking(range);
                // the mapping may have moved while we were waiting for the lock
                if self.map.rev_lookup(phys).addr == map::EMPTY {
                    self.inflight.unlock(range);
                    break;
                }

                let mut buf = self.gc_buf_pool.pop().unwrap_or_else(|| vec![0u8; self.page_bytes]);
                let mut rqd = Rqd::new(BioDirection::Read, phys * self.nr_phy_in_log, &mut buf, true);
                if self.bm.submit_io(&mut rqd).is_err() {
                    self.inflight.unlock(range);
                    let _ = self.gc_buf_pool.push(buf);
                    return Err(FtlError::GcFailed);
                }

                let write_result = self.map_page(logical, true).ok_or(FtlError::GcFailed).and_then(|mapping| {
                    let mut rqd = Rqd::new(BioDirection::Write, mapping.phys * self.nr_phy_in_log, &mut buf, true);
                    self.bm.submit_io(&mut rqd).map_err(|_| FtlError::GcFailed)
                });
                self.inflight.unlock(range);
                let _ = self.gc_buf_pool.push(buf);
                write_result?;
                break;
            }
        }

        if !block.invalid_pages_full() {
            return Err(FtlError::GcFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemDevice;

    fn rrpc(nr_luns: usize, nr_blocks: usize, nr_pages_per_block: u32) -> Rrpc {
        let device = Arc::new(MemDevice::new(nr_luns, nr_blocks, nr_pages_per_block));
        let bm = Arc::new(BlockManager::attach(device).unwrap());
        Rrpc::new(bm).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let r = rrpc(1, 8, 8);
        let mut data = vec![0xab; 512];
        assert_eq!(r.write_rq(3, &mut data, false), RqOutcome::Ok);

        let mut out = vec![0u8; 512];
        assert_eq!(r.read_rq(3, &mut out), RqOutcome::Ok);
        assert_eq!(out, data);
    }

    #[test]
    fn overwrite_invalidates_old_physical_page() {
        let r = rrpc(1, 8, 8);
        let mut d1 = vec![0x11; 512];
        let mut d2 = vec![0x22; 512];
        r.write_rq(3, &mut d1, false);
        let old_phys = r.map.lookup(3).addr;
        r.write_rq(3, &mut d2, false);
        let new_phys = r.map.lookup(3).addr;
        assert_ne!(old_phys, new_phys);

        let (old_block, old_slot) = r.bm.locate_page(old_phys);
        assert!(r.bm.block(old_block).check_invariant());
        let _ = old_slot;
        assert!(r.bm.block(old_block).nr_invalid_pages() >= 1);
    }

    #[test]
    fn unmapped_read_completes_done_without_stray_inflight() {
        let r = rrpc(1, 8, 8);
        let mut out = vec![0u8; 512];
        assert_eq!(r.read_rq(5, &mut out), RqOutcome::Done);
        assert!(r.inflight.try_lock(Range::new(5, 1)));
    }

    #[test]
    fn discard_then_read_is_unmapped() {
        let r = rrpc(1, 8, 8);
        let mut data = vec![0x33; 512];
        r.write_rq(2, &mut data, false);
        r.discard(2, 1);
        let mut out = vec![0u8; 512];
        assert_eq!(r.read_rq(2, &mut out), RqOutcome::Done);
    }

    #[test]
    fn second_write_to_same_logical_page_requeues_until_first_completes() {
        let r = rrpc(1, 8, 8);
        let range = Range::new(10, 1);
        assert!(r.inflight.try_lock(range));
        let mut data = vec![0x44; 512];
        assert_eq!(r.write_rq(10, &mut data, false), RqOutcome::Requeue);
        r.inflight.unlock(range);
        assert_eq!(r.write_rq(10, &mut data, false), RqOutcome::Ok);
        assert_eq!(r.map.lookup(10).addr, r.map.lookup(10).addr);
    }

    #[test]
    fn capacity_is_nine_tenths_overprovisioned() {
        let r = rrpc(2, 20, 8);
        let expected = ((r.nr_pages - r.reserved_pages) / 10) * 9 * r.nr_phy_in_log;
        assert_eq!(r.capacity(), expected);
        assert!(r.capacity() < r.nr_pages * r.nr_phy_in_log);
    }
}
