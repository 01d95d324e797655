//! # Log Cursors
//!
//! Two cursor types walk the persistent log:
//!
//! - [`TxCursor`] iterates tx-entry slots, starting in the meta block's
//!   inline region and following the tx-log block chain. It can extend the
//!   chain when asked to (commit paths) or stop at the end (replay).
//! - [`LogCursor`] iterates a log-entry chain referenced by an indirect
//!   commit, decoding one entry per step.

use eyre::Result;

use crate::alloc::Allocator;
use crate::config::{BLOCK_SIZE, NUM_INLINE_TX_ENTRY, NUM_TX_ENTRY};
use crate::layout::{
    BitmapSet, LogEntryHead, LogicalBlockIdx, MetaBlock, TxEntry, TxEntrySlot, TxLogBlock,
};
use crate::mtable::MemTable;
use crate::pmem;

/// Position of one tx-entry slot: `block_idx == 0` addresses the meta
/// block's inline region, anything else a tx-log block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxEntryIdx {
    pub block_idx: LogicalBlockIdx,
    pub local_idx: u32,
}

impl TxEntryIdx {
    pub const BEGIN: TxEntryIdx = TxEntryIdx {
        block_idx: 0,
        local_idx: 0,
    };

    /// Slots in the region this index points into.
    pub fn capacity(&self) -> u32 {
        if self.block_idx == 0 {
            NUM_INLINE_TX_ENTRY as u32
        } else {
            NUM_TX_ENTRY as u32
        }
    }
}

/// Views the tx-log block at `lidx`.
pub fn tx_block<'a>(mtable: &'a MemTable, lidx: LogicalBlockIdx) -> Result<&'a TxLogBlock> {
    let ptr = mtable.get_addr(lidx)?;
    // SAFETY: a whole mapped block, block-aligned, living as long as the
    // mem table; tx blocks are only mutated through their atomics.
    Ok(unsafe { TxLogBlock::from_ptr(ptr) })
}

/// Cursor over tx-entry slots.
#[derive(Debug, Clone, Copy)]
pub struct TxCursor {
    pub idx: TxEntryIdx,
}

impl TxCursor {
    pub fn new(idx: TxEntryIdx) -> Self {
        Self { idx }
    }

    /// The slot under the cursor. Callers must have established the cursor
    /// is inside its region via [`TxCursor::ensure_in_block`].
    pub fn slot<'a>(&self, meta: &'a MetaBlock, mtable: &'a MemTable) -> Result<&'a TxEntrySlot> {
        debug_assert!(self.idx.local_idx < self.idx.capacity());
        if self.idx.block_idx == 0 {
            Ok(meta.inline_tx_entry(self.idx.local_idx as usize))
        } else {
            Ok(tx_block(mtable, self.idx.block_idx)?.entry(self.idx.local_idx as usize))
        }
    }

    pub fn entry(&self, meta: &MetaBlock, mtable: &MemTable) -> Result<TxEntry> {
        Ok(self.slot(meta, mtable)?.load())
    }

    /// Steps to the next slot within the current region; the cursor may land
    /// in the overflow state (`local_idx == capacity`).
    pub fn advance_slot(&mut self) {
        self.idx.local_idx += 1;
    }

    /// Resolves the overflow state by following the chain, extending it with
    /// a freshly allocated tx-log block when `alloc` is provided and no
    /// successor exists yet.
    ///
    /// Returns `false` when the cursor sits at the end of the log and may
    /// not extend it.
    pub fn ensure_in_block(
        &mut self,
        meta: &MetaBlock,
        mtable: &MemTable,
        mut alloc: Option<(&mut Allocator, &BitmapSet)>,
    ) -> Result<bool> {
        loop {
            if self.idx.local_idx < self.idx.capacity() {
                return Ok(true);
            }

            let next = if self.idx.block_idx == 0 {
                meta.log_head()
            } else {
                tx_block(mtable, self.idx.block_idx)?.next()
            };
            if next != 0 {
                self.idx = TxEntryIdx {
                    block_idx: next,
                    local_idx: 0,
                };
                continue;
            }

            let Some((allocator, bitmaps)) = alloc.as_mut() else {
                return Ok(false);
            };
            let new_idx = allocator.alloc(1, bitmaps)?;
            let base = mtable.get_addr(new_idx)?;
            // SAFETY: the freshly claimed block is exclusively ours until
            // published; it may hold stale bytes from a previous life, so it
            // is zeroed before anything can read it as a tx block.
            unsafe {
                std::ptr::write_bytes(base, 0, BLOCK_SIZE);
            }
            let new_block = tx_block(mtable, new_idx)?;
            new_block.set_prev(self.idx.block_idx);
            // SAFETY: flushing the block just initialized.
            unsafe { pmem::persist_fenced(base, BLOCK_SIZE) };

            let published = if self.idx.block_idx == 0 {
                meta.try_set_log_head(new_idx)
            } else {
                tx_block(mtable, self.idx.block_idx)?.try_set_next(new_idx)
            };
            if published {
                // the link is load-bearing for replay: flush it
                let link_ptr = if self.idx.block_idx == 0 {
                    meta as *const MetaBlock as *const u8
                } else {
                    mtable.get_addr(self.idx.block_idx)? as *const u8
                };
                // SAFETY: flushing the header line of a mapped block.
                unsafe { pmem::persist_fenced(link_ptr, 64) };
                meta.set_log_tail_hint(new_idx);
                self.idx = TxEntryIdx {
                    block_idx: new_idx,
                    local_idx: 0,
                };
            } else {
                // another thread linked a block first; ours goes back to the
                // free list and the cursor follows the winner
                allocator.free(new_idx, 1);
            }
        }
    }
}

/// Cursor over a log-entry chain. Loading a position decodes the entry's
/// head and run starts eagerly.
#[derive(Debug)]
pub struct LogCursor {
    pub block_idx: LogicalBlockIdx,
    pub local_idx: u16,
    pub head: LogEntryHead,
    pub lidxs: Vec<u32>,
}

impl LogCursor {
    pub fn load(mtable: &MemTable, block_idx: LogicalBlockIdx, local_idx: u16) -> Result<Self> {
        // SAFETY: log entries referenced by a committed entry are immutable;
        // concurrent appends to the same pool block touch disjoint slots.
        let block = unsafe { mtable.block_slice(block_idx)? };
        let head = LogEntryHead::decode(block, local_idx)?;
        let mut lidxs = Vec::with_capacity(head.num_lidxs());
        head.decode_lidxs(block, local_idx, &mut lidxs)?;
        Ok(Self {
            block_idx,
            local_idx,
            head,
            lidxs,
        })
    }

    /// Moves to the next entry of the chain; `false` at the terminal entry.
    pub fn advance(&mut self, mtable: &MemTable) -> Result<bool> {
        if self.head.has_next == 0 {
            return Ok(false);
        }
        let block_idx = if self.head.next_block_idx.get() != 0 {
            self.head.next_block_idx.get()
        } else {
            self.block_idx
        };
        *self = Self::load(mtable, block_idx, self.head.next_local_idx.get())?;
        Ok(true)
    }
}
