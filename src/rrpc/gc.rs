//! Victim selection (SPEC_FULL.md §4.2.6). Block reclamation itself
//! (`move_valid_pages`/`block_gc`) lives on `Rrpc` in `mod.rs`, since it
//! needs `map_page` and the device adapter; this module is the pure,
//! independently-testable selection policy.

use std::collections::VecDeque;

use crate::block_manager::block::BlockId;

/// `need = max(nr_blocks / GC_LIMIT_INVERSE, nr_luns)`.
pub const GC_LIMIT_INVERSE: usize = 10;

pub fn victims_needed(nr_blocks: usize, nr_luns: usize) -> usize {
    (nr_blocks / GC_LIMIT_INVERSE).max(nr_luns)
}

/// Pops victims from a LUN's priority list while capacity is short. Picks
/// the block with the highest invalid-page count each round; stops as soon
/// as the best remaining candidate has nothing to reclaim, without
/// removing it (it stays queued for a future tick).
pub(crate) fn select_victims(
    prio_list: &mut VecDeque<BlockId>,
    nr_free_blocks: usize,
    mut need: usize,
    invalid_pages_of: impl Fn(BlockId) -> u32,
    is_full: impl Fn(BlockId) -> bool,
) -> Vec<BlockId> {
    let mut victims = Vec::new();
    while need > nr_free_blocks && !prio_list.is_empty() {
        let (pos, &id) = prio_list
            .iter()
            .enumerate()
            .max_by_key(|(_, &id)| invalid_pages_of(id))
            .expect("loop guard checked prio_list is non-empty");
        if invalid_pages_of(id) == 0 {
            break;
        }
        assert!(is_full(id), "priority-listed block must be full");
        prio_list.remove(pos);
        victims.push(id);
        need -= 1;
    }
    victims
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_highest_invalid_count_first() {
        // S2: three full blocks with invalid counts {3, 7, 5}; need=1.
        let counts = [(BlockId(0), 3u32), (BlockId(1), 7), (BlockId(2), 5)];
        let mut prio: VecDeque<BlockId> = counts.iter().map(|(id, _)| *id).collect();
        let lookup = |id: BlockId| counts.iter().find(|(b, _)| *b == id).unwrap().1;
        let victims = select_victims(&mut prio, 0, 1, lookup, |_| true);
        assert_eq!(victims, vec![BlockId(1)]);
        assert_eq!(prio.len(), 2);
    }

    #[test]
    fn stops_without_removing_when_best_candidate_is_clean() {
        let mut prio: VecDeque<BlockId> = vec![BlockId(0)].into();
        let victims = select_victims(&mut prio, 0, 1, |_| 0, |_| true);
        assert!(victims.is_empty());
        assert_eq!(prio.len(), 1, "clean block stays queued, not dropped");
    }

    #[test]
    fn stops_once_need_is_satisfied() {
        let mut prio: VecDeque<BlockId> = vec![BlockId(0), BlockId(1)].into();
        let victims = select_victims(&mut prio, 5, 5, |_| 4, |_| true);
        assert!(victims.is_empty(), "need <= nr_free_blocks means no GC needed");
    }
}
