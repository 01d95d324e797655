//! # Transaction-Log Blocks
//!
//! When the inline tx region of the meta block fills up, the log continues
//! through a doubly-linked chain of 4 KiB tx-log blocks. Entries fill
//! strictly front to back; `next` is published with a CAS only when a block
//! has no free slot left, so a reader that sees `next != 0` knows every slot
//! before it is decided.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::{BLOCK_SIZE, NUM_TX_ENTRY};
use crate::layout::{LogicalBlockIdx, TxEntry, TxEntrySlot};

#[repr(C, align(4096))]
pub struct TxLogBlock {
    prev: AtomicU32,
    next: AtomicU32,
    entries: [TxEntrySlot; NUM_TX_ENTRY],
}

const _: () = assert!(std::mem::size_of::<TxLogBlock>() == BLOCK_SIZE);

impl TxLogBlock {
    /// Views a mapped, zero-initialized 4 KiB block as a tx-log block.
    ///
    /// # Safety
    ///
    /// `ptr` must be 4096-aligned, point at a mapped block that outlives
    /// `'a`, and the block must only ever be mutated through this view.
    pub unsafe fn from_ptr<'a>(ptr: *const u8) -> &'a TxLogBlock {
        debug_assert_eq!(ptr as usize % BLOCK_SIZE, 0);
        // SAFETY: caller contract.
        unsafe { &*(ptr as *const TxLogBlock) }
    }

    pub fn prev(&self) -> LogicalBlockIdx {
        self.prev.load(Ordering::Acquire)
    }

    pub fn next(&self) -> LogicalBlockIdx {
        self.next.load(Ordering::Acquire)
    }

    /// Records the predecessor link. Only the allocating thread writes this,
    /// before the block is published.
    pub fn set_prev(&self, prev: LogicalBlockIdx) {
        self.prev.store(prev, Ordering::Release);
    }

    /// Publishes the successor block. Loses gracefully if another thread
    /// already linked one; the caller follows [`TxLogBlock::next`] instead.
    pub fn try_set_next(&self, next: LogicalBlockIdx) -> bool {
        self.next
            .compare_exchange(0, next, Ordering::Release, Ordering::Acquire)
            .is_ok()
    }

    pub fn entry(&self, local_idx: usize) -> &TxEntrySlot {
        &self.entries[local_idx]
    }

    pub fn get(&self, local_idx: usize) -> TxEntry {
        self.entries[local_idx].load()
    }

    /// Scans from `hint_tail` for the first empty slot and commits `entry`
    /// into it. Returns the committed index, or `None` when the block is
    /// full.
    pub fn try_commit(&self, entry: TxEntry, hint_tail: usize) -> Option<usize> {
        for idx in hint_tail..NUM_TX_ENTRY {
            if self.entries[idx].load().is_valid() {
                continue;
            }
            if self.entries[idx].try_commit(entry) {
                return Some(idx);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> Box<TxLogBlock> {
        // SAFETY: TxLogBlock is all atomics; the all-zero pattern is its
        // empty state, same as a freshly allocated block in the file.
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn commit_fills_front_to_back() {
        let block = blank();
        let a = TxEntry::inline(1, 0, 5);
        let b = TxEntry::inline(1, 1, 6);

        assert_eq!(block.try_commit(a, 0), Some(0));
        assert_eq!(block.try_commit(b, 0), Some(1));
        assert_eq!(block.get(0), a);
        assert_eq!(block.get(1), b);
    }

    #[test]
    fn commit_respects_hint_tail() {
        let block = blank();
        let e = TxEntry::inline(1, 0, 5);

        assert_eq!(block.try_commit(e, 100), Some(100));
    }

    #[test]
    fn full_block_rejects_commit() {
        let block = blank();
        for i in 0..NUM_TX_ENTRY {
            assert!(block.entry(i).try_commit(TxEntry::dummy()));
        }

        assert_eq!(block.try_commit(TxEntry::inline(1, 0, 5), 0), None);
    }

    #[test]
    fn next_publishes_exactly_once() {
        let block = blank();

        assert!(block.try_set_next(42));
        assert!(!block.try_set_next(43));
        assert_eq!(block.next(), 42);
    }
}
