//! # Block Allocator
//!
//! Per-thread allocator over the persistent bitmaps. The bitmap hands out
//! whole 64-block words; the allocator carves them up through a small sorted
//! free list of `(count, start)` runs, so the common small allocation never
//! touches shared memory at all.
//!
//! The allocator also owns the thread's current log-entry block: a 4 KiB
//! slab carved into 8-byte slots that log entries are bump-allocated from.
//! Keeping the slab per thread means log-entry writes never contend.
//!
//! Blocks freed here go to the volatile free list only; the persistent
//! bitmap bit stays set until the next bitmap rebuild replays the log and
//! recomputes liveness. That is also what reclaims blocks an abandoned
//! transaction left behind.

use eyre::{ensure, Result, WrapErr};
use smallvec::SmallVec;

use crate::config::{LOG_SLOT_SIZE, MAX_ALLOC_BLOCKS, NUM_LOG_SLOTS};
use crate::layout::{BitmapSet, LogicalBlockIdx};
use crate::mtable::MemTable;

/// A free run: `count` contiguous blocks starting at `start`. Ordered by
/// count first so best-fit is a partition point.
type FreeRun = (u32, LogicalBlockIdx);

pub struct Allocator {
    /// Bitmap word to resume batch claiming from.
    recent_bitmap_word: usize,
    /// Sorted free runs carved from claimed words.
    free_list: SmallVec<[FreeRun; 16]>,
    /// Current log-entry slab, 0 = none yet.
    log_block_idx: LogicalBlockIdx,
    log_block_base: *mut u8,
    /// Next free 8-byte slot in the slab; `NUM_LOG_SLOTS` when exhausted.
    free_log_local_idx: u16,
    /// Every slab this thread ever claimed, oldest first.
    log_blocks: SmallVec<[LogicalBlockIdx; 8]>,
}

// SAFETY: the raw slab pointer targets a mapping that outlives the file and
// is only dereferenced by the thread holding this allocator's slot lock.
unsafe impl Send for Allocator {}

impl Allocator {
    pub fn new() -> Self {
        Self {
            recent_bitmap_word: 0,
            free_list: SmallVec::new(),
            log_block_idx: 0,
            log_block_base: std::ptr::null_mut(),
            free_log_local_idx: NUM_LOG_SLOTS as u16,
            log_blocks: SmallVec::new(),
        }
    }

    /// Allocates `num_blocks` contiguous logical blocks (at most one bitmap
    /// word's worth; larger writes are split by the caller).
    pub fn alloc(&mut self, num_blocks: u32, bitmaps: &BitmapSet) -> Result<LogicalBlockIdx> {
        ensure!(
            num_blocks >= 1 && num_blocks <= MAX_ALLOC_BLOCKS,
            "allocation of {num_blocks} blocks exceeds the bitmap batch size"
        );

        // best fit from the free list: smallest run that still fits
        let pos = self.free_list.partition_point(|run| run.0 < num_blocks);
        if pos < self.free_list.len() {
            let (count, start) = self.free_list[pos];
            if count == num_blocks {
                self.free_list.remove(pos);
                return Ok(start);
            }
            // shrink in place and restore the ordering
            self.free_list[pos] = (count - num_blocks, start + num_blocks);
            self.free_list.sort_unstable();
            return Ok(start);
        }

        // claim a whole word from the persistent bitmap
        let word = bitmaps
            .alloc_batch(self.recent_bitmap_word)
            .wrap_err("bitmap exhausted")?;
        self.recent_bitmap_word = word + 1;
        let start = BitmapSet::first_block_of_word(word);
        if num_blocks < MAX_ALLOC_BLOCKS {
            self.free_list
                .push((MAX_ALLOC_BLOCKS - num_blocks, start + num_blocks));
            self.free_list.sort_unstable();
        }
        Ok(start)
    }

    /// Returns one run to the free list.
    pub fn free(&mut self, block_idx: LogicalBlockIdx, num_blocks: u32) {
        if block_idx == 0 || num_blocks == 0 {
            return;
        }
        self.free_list.push((num_blocks, block_idx));
        self.free_list.sort_unstable();
    }

    /// Returns the blocks of a replaced mapping. Adjacent logical blocks are
    /// coalesced in one pass; no attempt is made to merge with runs already
    /// on the list (scanning it on the hot path costs more than it saves).
    pub fn free_image(&mut self, image: &[LogicalBlockIdx]) {
        let mut run_start: LogicalBlockIdx = 0;
        let mut run_len: u32 = 0;
        for &lidx in image {
            if run_len > 0 && lidx == run_start + run_len {
                run_len += 1;
                continue;
            }
            if run_len > 0 {
                self.free_list.push((run_len, run_start));
            }
            run_start = lidx;
            run_len = if lidx == 0 { 0 } else { 1 };
        }
        if run_len > 0 {
            self.free_list.push((run_len, run_start));
        }
        self.free_list.sort_unstable();
    }

    /// Reserves `slots` log-entry slots in the thread's slab, rolling over
    /// to a freshly allocated block when the current one cannot fit the
    /// entry. The returned slot range is zeroed so a torn write can never
    /// decode as a valid entry. With `pack_align` the slot cursor is first
    /// rounded up to a 16-byte boundary.
    pub fn alloc_log_entry(
        &mut self,
        slots: usize,
        pack_align: bool,
        bitmaps: &BitmapSet,
        mtable: &MemTable,
    ) -> Result<(LogicalBlockIdx, u16, *mut u8)> {
        debug_assert!(slots >= 1 && slots <= NUM_LOG_SLOTS);
        if pack_align {
            self.free_log_local_idx = self.free_log_local_idx.next_multiple_of(2);
        }

        if self.free_log_local_idx as usize + slots > NUM_LOG_SLOTS {
            let idx = self.alloc(1, bitmaps)?;
            let base = mtable.get_addr(idx)?;
            self.log_blocks.push(idx);
            self.log_block_idx = idx;
            self.log_block_base = base;
            self.free_log_local_idx = 0;
        }

        let local = self.free_log_local_idx;
        self.free_log_local_idx += slots as u16;
        // SAFETY: the slot range is inside the slab block this thread owns
        // exclusively; zeroed before anything can reference it.
        unsafe {
            std::ptr::write_bytes(
                self.log_block_base.add(local as usize * LOG_SLOT_SIZE),
                0,
                slots * LOG_SLOT_SIZE,
            );
        }
        Ok((self.log_block_idx, local, self.log_block_base))
    }

    #[cfg(test)]
    pub(crate) fn free_list_len(&self) -> usize {
        self.free_list.len()
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NUM_BITMAP_PER_BLOCK, NUM_INLINE_BITMAP};
    use crate::layout::Bitmap;
    use smallvec::SmallVec as SV;

    fn test_bitmaps() -> BitmapSet {
        let inline: &'static [Bitmap] = Box::leak(
            (0..NUM_INLINE_BITMAP)
                .map(|_| unsafe { std::mem::zeroed::<Bitmap>() })
                .collect(),
        );
        let block: &'static [Bitmap] = Box::leak(
            (0..NUM_BITMAP_PER_BLOCK)
                .map(|_| unsafe { std::mem::zeroed::<Bitmap>() })
                .collect(),
        );
        let mut blocks: SV<[*const Bitmap; 8]> = SV::new();
        blocks.push(block.as_ptr());
        // SAFETY: leaked arrays outlive the set.
        let set = unsafe { BitmapSet::from_raw_parts(inline.as_ptr(), blocks) };
        // block 0 is structural in a real file, which keeps word 0 from ever
        // being batch-claimed; mirror that here
        set.set_allocated(0);
        set
    }

    #[test]
    fn first_allocation_claims_first_free_word() {
        let bitmaps = test_bitmaps();
        let mut alloc = Allocator::new();

        let lidx = alloc.alloc(4, &bitmaps).unwrap();

        assert_eq!(lidx, 64);
        assert_eq!(alloc.free_list_len(), 1);
        // remainder of the word is on the free list
        assert_eq!(alloc.alloc(60, &bitmaps).unwrap(), 68);
        assert_eq!(alloc.free_list_len(), 0);
    }

    #[test]
    fn exact_match_pops_the_run() {
        let bitmaps = test_bitmaps();
        let mut alloc = Allocator::new();

        let a = alloc.alloc(64, &bitmaps).unwrap();
        alloc.free(a, 64);
        let b = alloc.alloc(64, &bitmaps).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn smaller_run_is_preferred() {
        let bitmaps = test_bitmaps();
        let mut alloc = Allocator::new();

        let a = alloc.alloc(64, &bitmaps).unwrap();
        let b = alloc.alloc(64, &bitmaps).unwrap();
        alloc.free(a, 2);
        alloc.free(b, 64);

        // the 2-run satisfies the request; the 64-run stays intact
        assert_eq!(alloc.alloc(2, &bitmaps).unwrap(), a);
        assert_eq!(alloc.alloc(64, &bitmaps).unwrap(), b);
    }

    #[test]
    fn alloc_free_cycles_keep_the_list_bounded() {
        let bitmaps = test_bitmaps();
        let mut alloc = Allocator::new();

        for _ in 0..1000 {
            let lidx = alloc.alloc(1, &bitmaps).unwrap();
            alloc.free(lidx, 1);
        }

        // a full word recoalesces into at most the freed single plus the
        // word remainder; the list must not grow with the cycle count
        assert!(alloc.free_list_len() <= 2);
    }

    #[test]
    fn free_image_coalesces_adjacent_runs() {
        let bitmaps = test_bitmaps();
        let mut alloc = Allocator::new();
        let base = alloc.alloc(64, &bitmaps).unwrap();

        // 5 consecutive, a hole, 2 consecutive
        let image = [base, base + 1, base + 2, base + 3, base + 4, 0, base + 10, base + 11];
        alloc.free_image(&image);

        assert_eq!(alloc.free_list_len(), 2);
        assert_eq!(alloc.alloc(5, &bitmaps).unwrap(), base);
        assert_eq!(alloc.alloc(2, &bitmaps).unwrap(), base + 10);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let bitmaps = test_bitmaps();
        let mut alloc = Allocator::new();

        assert!(alloc.alloc(65, &bitmaps).is_err());
        assert!(alloc.alloc(0, &bitmaps).is_err());
    }
}
