//! In-memory reference `DeviceAdapter`, used by this crate's own tests in
//! place of a real Host Runtime driving real flash (SPEC_FULL.md §4.3).

use std::sync::Mutex;

use crate::device::{BioDirection, ChannelGeometry, DeviceAdapter, Rqd};
use crate::error::DeviceError;

const SECTOR_SIZE: u32 = 512;

fn geometry(nr_blocks: usize, nr_pages_per_block: u32) -> ChannelGeometry {
    let granularity_erase = SECTOR_SIZE * nr_pages_per_block;
    let sectors = nr_blocks as u64 * nr_pages_per_block as u64;
    ChannelGeometry {
        queue_size: 64,
        granularity_read: SECTOR_SIZE,
        granularity_write: SECTOR_SIZE,
        granularity_erase,
        laddr_begin: 0,
        laddr_end: sectors - 1,
    }
}

struct LunState {
    storage: Vec<u8>,
    bad_blocks: Vec<bool>,
}

/// A single-device, single-or-multi-LUN in-memory stand-in. Every LUN shares
/// the same geometry. `with_bad_blocks`/`with_l2p` are builder hooks for
/// tests; by default all blocks are good and the L2P table is empty.
pub struct MemDevice {
    geometries: Vec<ChannelGeometry>,
    nr_pages_per_block: u32,
    luns: Vec<Mutex<LunState>>,
    l2p: Vec<u64>,
    fail_bb_tbl: bool,
    fail_l2p_tbl: bool,
}

impl MemDevice {
    pub fn new(nr_luns: usize, nr_blocks: usize, nr_pages_per_block: u32) -> Self {
        let g = geometry(nr_blocks, nr_pages_per_block);
        let page_bytes = SECTOR_SIZE as usize;
        let luns = (0..nr_luns)
            .map(|_| {
                Mutex::new(LunState {
                    storage: vec![0u8; nr_blocks * nr_pages_per_block as usize * page_bytes],
                    bad_blocks: vec![false; nr_blocks],
                })
            })
            .collect();
        MemDevice {
            geometries: vec![g; nr_luns],
            nr_pages_per_block,
            luns,
            l2p: Vec::new(),
            fail_bb_tbl: false,
            fail_l2p_tbl: false,
        }
    }

    /// Marks block indices (within LUN 0) as bad.
    pub fn with_bad_blocks(mut self, blocks: &[usize]) -> Self {
        let mut state = self.luns[0].lock().unwrap();
        for &b in blocks {
            state.bad_blocks[b] = true;
        }
        drop(state);
        self
    }

    /// Identity-maps the given physical page numbers as in-use logical pages.
    pub fn with_l2p(mut self, pages: &[u64]) -> Self {
        let total: u64 = self.geometries.iter().map(|g| g.nr_blocks() * g.nr_pages_per_block() as u64).sum();
        let mut table = vec![u64::MAX; total as usize];
        for &p in pages {
            if (p as usize) < table.len() {
                table[p as usize] = p;
            } else if !table.is_empty() {
                // Out-of-range value used as a fixture for the DeviceProtocol
                // error path; placed at logical page 0.
                table[0] = p;
            }
        }
        self.l2p = table;
        self
    }

    pub fn with_failing_bb_tbl(mut self) -> Self {
        self.fail_bb_tbl = true;
        self
    }

    pub fn with_failing_l2p_tbl(mut self) -> Self {
        self.fail_l2p_tbl = true;
        self
    }

    fn page_bytes(&self) -> usize {
        SECTOR_SIZE as usize
    }
}

impl DeviceAdapter for MemDevice {
    fn identity(&self) -> &[ChannelGeometry] {
        &self.geometries
    }

    fn submit_io(&self, rqd: &mut Rqd<'_>) -> Result<(), DeviceError> {
        let page_bytes = self.page_bytes();
        let pages_per_lun = self.geometries[0].nr_blocks() * self.nr_pages_per_block as u64;
        let lun_id = (rqd.physical_sector / pages_per_lun) as usize;
        let page_in_lun = (rqd.physical_sector % pages_per_lun) as usize;
        let mut state = self.luns[lun_id].lock().unwrap();
        let offset = page_in_lun * page_bytes;
        let result = match rqd.direction {
            BioDirection::Read => {
                let len = rqd.buf.len().min(page_bytes);
                rqd.buf[..len].copy_from_slice(&state.storage[offset..offset + len]);
                Ok(())
            }
            BioDirection::Write => {
                let len = rqd.buf.len().min(page_bytes);
                state.storage[offset..offset + len].copy_from_slice(&rqd.buf[..len]);
                Ok(())
            }
            BioDirection::Discard => Ok(()),
        };
        rqd.complete(result);
        result
    }

    fn erase_block(&self, lun: usize, block_in_lun: u32) -> Result<(), DeviceError> {
        let page_bytes = self.page_bytes();
        let mut state = self.luns[lun].lock().unwrap();
        let start = block_in_lun as usize * self.nr_pages_per_block as usize * page_bytes;
        let end = start + self.nr_pages_per_block as usize * page_bytes;
        state.storage[start..end].iter_mut().for_each(|b| *b = 0xff);
        Ok(())
    }

    fn get_bb_tbl(&self, lun: usize, _nr_blocks: u32) -> Result<Vec<bool>, DeviceError> {
        if self.fail_bb_tbl {
            return Err(DeviceError::BadBlockTableFail);
        }
        Ok(self.luns[lun].lock().unwrap().bad_blocks.clone())
    }

    fn get_l2p_tbl(&self, start: u64, n: u64) -> Result<Vec<u64>, DeviceError> {
        if self.fail_l2p_tbl {
            return Err(DeviceError::L2pFail);
        }
        if self.l2p.is_empty() {
            return Ok(vec![u64::MAX; n as usize]);
        }
        Ok((start..start + n).map(|i| self.l2p.get(i as usize).copied().unwrap_or(u64::MAX)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BioDirection;

    #[test]
    fn write_then_read_round_trips() {
        let dev = MemDevice::new(1, 2, 4);
        let mut write_buf = vec![0xab; 512];
        let mut rqd = Rqd::new(BioDirection::Write, 5, &mut write_buf, false);
        dev.submit_io(&mut rqd).unwrap();

        let mut read_buf = vec![0u8; 512];
        let mut rqd = Rqd::new(BioDirection::Read, 5, &mut read_buf, false);
        dev.submit_io(&mut rqd).unwrap();
        assert_eq!(read_buf, vec![0xab; 512]);
    }

    #[test]
    fn erase_zeroes_the_block_to_0xff() {
        let dev = MemDevice::new(1, 2, 4);
        let mut write_buf = vec![0x11; 512];
        let mut rqd = Rqd::new(BioDirection::Write, 0, &mut write_buf, false);
        dev.submit_io(&mut rqd).unwrap();
        dev.erase_block(0, 0).unwrap();

        let mut read_buf = vec![0u8; 512];
        let mut rqd = Rqd::new(BioDirection::Read, 0, &mut read_buf, false);
        dev.submit_io(&mut rqd).unwrap();
        assert_eq!(read_buf, vec![0xffu8; 512]);
    }
}
