//! # Meta Block
//!
//! Block 0 of every core file. The layout is cache-line based to keep the
//! contended pieces apart:
//!
//! ```text
//! CL 0      signature, file_size, num_blocks, num_bitmap_blocks,
//!           log_head, log_tail        (mutated under the meta lock,
//!                                      hints published atomically)
//! CL 1      meta lock (robust process-shared mutex, isolated so lock
//!           traffic does not thrash the header line)
//! CL 2-3    inline bitmaps            (16 words, logical blocks 0..1024)
//! CL 4-63   inline tx entries         (480 slots, the head of the log)
//! ```

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{ensure, Result};

use crate::config::{
    BLOCK_SIZE, CACHELINE_SIZE, NUM_INLINE_BITMAP, NUM_INLINE_TX_ENTRY, SIGNATURE,
};
use crate::error::FsError;
use crate::layout::{Bitmap, LogicalBlockIdx, TxEntrySlot};
use crate::pmem;
use crate::sync::RobustMutex;

#[repr(C, align(4096))]
pub struct MetaBlock {
    // cache line 0; the signature is written once, when a fresh file is
    // stamped, and read-only forever after
    signature: UnsafeCell<[u8; 16]>,
    file_size: AtomicU64,
    num_blocks: AtomicU32,
    num_bitmap_blocks: AtomicU32,
    log_head: AtomicU32,
    log_tail: AtomicU32,
    _pad0: [u8; CACHELINE_SIZE - 40],

    // cache line 1
    meta_lock: RobustMutex,
    _pad1: [u8; CACHELINE_SIZE - std::mem::size_of::<RobustMutex>()],

    // cache lines 2-3
    inline_bitmaps: [Bitmap; NUM_INLINE_BITMAP],

    // cache lines 4-63
    inline_tx_entries: [TxEntrySlot; NUM_INLINE_TX_ENTRY],
}

const _: () = assert!(std::mem::size_of::<MetaBlock>() == BLOCK_SIZE);
const _: () = assert!(std::mem::size_of::<RobustMutex>() <= CACHELINE_SIZE);

// SAFETY: every shared field is an atomic or the robust mutex; the
// UnsafeCell'd signature is written exactly once while the creating process
// has exclusive access to the zero-sized file.
unsafe impl Sync for MetaBlock {}

impl MetaBlock {
    /// Views block 0 of the mapping as the meta block.
    ///
    /// # Safety
    ///
    /// `ptr` must be 4096-aligned and point at the first block of a mapping
    /// that outlives `'a`.
    pub unsafe fn from_ptr<'a>(ptr: *const u8) -> &'a MetaBlock {
        debug_assert_eq!(ptr as usize % BLOCK_SIZE, 0);
        // SAFETY: caller contract.
        unsafe { &*(ptr as *const MetaBlock) }
    }

    /// Stamps a freshly created (all-zero) file: signature, meta lock,
    /// structural bits for block 0 and the bitmap blocks.
    pub fn init(&self, num_blocks: u32, num_bitmap_blocks: u32) -> Result<()> {
        ensure!(
            1 + num_bitmap_blocks <= NUM_INLINE_BITMAP as u32 * 64,
            "bitmap blocks must be covered by the inline bitmap"
        );
        self.meta_lock.init()?;
        self.num_blocks.store(num_blocks, Ordering::Release);
        self.num_bitmap_blocks
            .store(num_bitmap_blocks, Ordering::Release);
        for lidx in 0..=num_bitmap_blocks {
            self.inline_bitmaps[(lidx / 64) as usize].set_allocated(lidx % 64);
        }
        // the signature is stamped last: a crash mid-init leaves a file that
        // simply fails verification and falls back to host I/O
        // SAFETY: the creating process has exclusive access to the fresh
        // file, so no reader can observe the signature mid-write.
        unsafe {
            pmem::persist_fenced(self as *const MetaBlock as *const u8, BLOCK_SIZE);
            *self.signature.get() = SIGNATURE;
            pmem::persist_fenced(self.signature.get() as *const u8, 16);
        }
        Ok(())
    }

    pub fn verify_signature(&self) -> bool {
        // SAFETY: the signature is immutable after init.
        unsafe { *self.signature.get() == SIGNATURE }
    }

    pub fn lock(&self) -> Result<()> {
        self.meta_lock.lock()
    }

    pub fn unlock(&self) {
        self.meta_lock.unlock()
    }

    pub fn file_size_hint(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// Refreshes the persistent size hint. Caller holds the meta lock.
    pub fn set_file_size_hint(&self, size: u64) {
        self.file_size.store(size, Ordering::Release);
        // SAFETY: flushing the header line of this live block.
        unsafe { pmem::persist_fenced(self as *const MetaBlock as *const u8, CACHELINE_SIZE) };
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks.load(Ordering::Acquire)
    }

    /// Publishes a new block count. Caller holds the meta lock (growth is
    /// serialized); readers go through the lock-free fast path.
    pub fn set_num_blocks(&self, num_blocks: u32) {
        self.num_blocks.store(num_blocks, Ordering::Release);
    }

    pub fn num_bitmap_blocks(&self) -> u32 {
        self.num_bitmap_blocks.load(Ordering::Acquire)
    }

    /// First tx-log block after the inline region, 0 when the log still fits
    /// inline.
    pub fn log_head(&self) -> LogicalBlockIdx {
        self.log_head.load(Ordering::Acquire)
    }

    /// Publishes the first overflow tx block. Loses gracefully to a
    /// concurrent publisher.
    pub fn try_set_log_head(&self, head: LogicalBlockIdx) -> bool {
        self.log_head
            .compare_exchange(0, head, Ordering::Release, Ordering::Acquire)
            .is_ok()
    }

    /// Hint to the latest tx-log block; may lag behind the true tail.
    pub fn log_tail_hint(&self) -> LogicalBlockIdx {
        self.log_tail.load(Ordering::Acquire)
    }

    pub fn set_log_tail_hint(&self, tail: LogicalBlockIdx) {
        self.log_tail.store(tail, Ordering::Release);
    }

    pub fn inline_bitmaps(&self) -> &[Bitmap] {
        &self.inline_bitmaps
    }

    pub fn inline_tx_entry(&self, local_idx: usize) -> &TxEntrySlot {
        &self.inline_tx_entries[local_idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_BITMAP_BLOCKS;
    use crate::layout::TxEntry;

    fn blank() -> Box<MetaBlock> {
        // SAFETY: all-zero is the state of block 0 in a fresh file.
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn meta_block_is_one_block() {
        assert_eq!(std::mem::size_of::<MetaBlock>(), BLOCK_SIZE);
    }

    #[test]
    fn init_stamps_signature_and_structural_bits() {
        let meta = blank();

        assert!(!meta.verify_signature());
        meta.init(512, NUM_BITMAP_BLOCKS).unwrap();

        assert!(meta.verify_signature());
        assert_eq!(meta.num_blocks(), 512);
        assert_eq!(meta.num_bitmap_blocks(), NUM_BITMAP_BLOCKS);
        for lidx in 0..=NUM_BITMAP_BLOCKS {
            assert!(meta.inline_bitmaps()[0].is_allocated(lidx));
        }
        assert!(!meta.inline_bitmaps()[0].is_allocated(NUM_BITMAP_BLOCKS + 1));
    }

    #[test]
    fn meta_lock_cycles() {
        let meta = blank();
        meta.init(512, NUM_BITMAP_BLOCKS).unwrap();

        meta.lock().unwrap();
        meta.unlock();
        meta.lock().unwrap();
        meta.unlock();
    }

    #[test]
    fn log_head_publishes_once() {
        let meta = blank();
        meta.init(512, NUM_BITMAP_BLOCKS).unwrap();

        assert_eq!(meta.log_head(), 0);
        assert!(meta.try_set_log_head(7));
        assert!(!meta.try_set_log_head(8));
        assert_eq!(meta.log_head(), 7);
    }

    #[test]
    fn inline_tx_entries_commit_like_any_slot() {
        let meta = blank();
        meta.init(512, NUM_BITMAP_BLOCKS).unwrap();
        let e = TxEntry::inline(1, 0, 5);

        assert!(meta.inline_tx_entry(0).try_commit(e));
        assert!(!meta.inline_tx_entry(0).try_commit(e));
        assert_eq!(meta.inline_tx_entry(0).load(), e);
        assert!(!meta.inline_tx_entry(1).load().is_valid());
    }
}
