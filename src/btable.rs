//! # Block Table
//!
//! The volatile virtual→logical index. It is a pure function of the
//! committed log prefix: `update` replays entries in log order from the
//! last cursor position, so any thread can catch the table up to the tail
//! before reading or committing. The replay lock makes each replay step
//! atomic: a reader never observes a half-applied transaction.
//!
//! Replay also derives the logical file size: every commit entry implies an
//! end position (`(begin_vidx + num_blocks) * BLOCK_SIZE - leftover_bytes`)
//! and the size is the running maximum.
//!
//! With `init_bitmap` set (first open after the shared-memory region was
//! created), replay additionally publishes every block it proves live into
//! the persistent bitmap: structural blocks, tx-log blocks, log-entry
//! blocks and mapped data blocks. Everything else stays free, which is how
//! blocks leaked by transactions that died before their commit CAS are
//! reclaimed.

use eyre::Result;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::alloc::Allocator;
use crate::config::{BLOCK_SHIFT, MAX_BLOCKS_PER_BODY};
use crate::file::File;
use crate::layout::{LogicalBlockIdx, TxEntryKind, VirtualBlockIdx};
use crate::tx::{LogCursor, TxCursor, TxEntryIdx};

/// Replayed state snapshot: where the cursor stopped and the file size the
/// committed prefix implies.
#[derive(Debug, Clone, Copy)]
pub struct FileState {
    pub cursor: TxEntryIdx,
    pub file_size: u64,
}

struct Inner {
    table: Vec<LogicalBlockIdx>,
    tail: TxEntryIdx,
    file_size: u64,
}

pub struct BlkTable {
    inner: Mutex<Inner>,
}

impl BlkTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                table: Vec::new(),
                tail: TxEntryIdx::BEGIN,
                file_size: 0,
            }),
        }
    }

    /// The logical block mapped at `vidx`; 0 for a hole.
    pub fn get(&self, vidx: VirtualBlockIdx) -> LogicalBlockIdx {
        let inner = self.inner.lock();
        inner.table.get(vidx as usize).copied().unwrap_or(0)
    }

    /// One-lock snapshot of `num_blocks` mappings starting at `begin`.
    pub fn snapshot_range(
        &self,
        begin: VirtualBlockIdx,
        num_blocks: u32,
    ) -> SmallVec<[LogicalBlockIdx; 8]> {
        let inner = self.inner.lock();
        (begin..begin + num_blocks)
            .map(|v| inner.table.get(v as usize).copied().unwrap_or(0))
            .collect()
    }

    /// Replays committed entries from the stored cursor to the log tail.
    ///
    /// `do_alloc` lets the replay extend the tx-log chain past a full block
    /// (commit paths need the next block to exist); `allocator` must be
    /// provided with it. `init_bitmap` publishes liveness into the
    /// persistent bitmap while replaying.
    pub fn update(
        &self,
        file: &File,
        do_alloc: bool,
        init_bitmap: bool,
        mut allocator: Option<&mut Allocator>,
    ) -> Result<FileState> {
        let meta = file.meta();
        let mtable = file.mtable();
        let mut inner = self.inner.lock();

        let mut cursor = TxCursor::new(inner.tail);
        loop {
            let alloc_ctx = match (do_alloc, allocator.as_deref_mut()) {
                (true, Some(a)) => Some((a, file.bitmaps())),
                _ => None,
            };
            if !cursor.ensure_in_block(meta, mtable, alloc_ctx)? {
                break;
            }
            if init_bitmap && cursor.idx.block_idx != 0 {
                file.set_allocated(cursor.idx.block_idx);
            }

            let entry = cursor.entry(meta, mtable)?;
            match entry.kind() {
                TxEntryKind::Invalid => break,
                TxEntryKind::Dummy => {}
                TxEntryKind::Inline(e) => {
                    Self::apply_inline(
                        &mut inner,
                        file,
                        e.begin_vidx,
                        e.num_blocks,
                        &[e.begin_lidx],
                        0,
                        init_bitmap,
                    );
                }
                TxEntryKind::Indirect(e) => {
                    Self::apply_indirect(&mut inner, file, e.log_block_idx, e.log_local_idx, init_bitmap)?;
                }
            }
            cursor.advance_slot();
        }

        inner.tail = cursor.idx;
        file.try_pin_tx_block(cursor.idx.block_idx);
        Ok(FileState {
            cursor: inner.tail,
            file_size: inner.file_size,
        })
    }

    /// Applies one mapped range: `begin_lidxs` in stride-64 runs, exactly as
    /// log entries carry them.
    fn apply_inline(
        inner: &mut Inner,
        file: &File,
        begin_vidx: VirtualBlockIdx,
        num_blocks: u32,
        begin_lidxs: &[LogicalBlockIdx],
        leftover_bytes: u16,
        init_bitmap: bool,
    ) {
        let end_vidx = begin_vidx + num_blocks;
        Self::resize_to_fit(&mut inner.table, end_vidx);

        let mut done = 0u32;
        let mut run = 0usize;
        while done < num_blocks {
            let chunk = (num_blocks - done).min(MAX_BLOCKS_PER_BODY);
            let base = begin_lidxs[run];
            for i in 0..chunk {
                let lidx = base + i;
                inner.table[(begin_vidx + done + i) as usize] = lidx;
                if init_bitmap {
                    file.set_allocated(lidx);
                }
            }
            done += chunk;
            run += 1;
        }

        let end_bytes = ((end_vidx as u64) << BLOCK_SHIFT) - leftover_bytes as u64;
        inner.file_size = inner.file_size.max(end_bytes);
    }

    fn apply_indirect(
        inner: &mut Inner,
        file: &File,
        log_block_idx: LogicalBlockIdx,
        log_local_idx: u16,
        init_bitmap: bool,
    ) -> Result<()> {
        let mut log = LogCursor::load(file.mtable(), log_block_idx, log_local_idx)?;
        loop {
            if init_bitmap {
                file.set_allocated(log.block_idx);
            }
            Self::apply_inline(
                inner,
                file,
                log.head.begin_vidx.get(),
                log.head.num_blocks.get() as u32,
                &log.lidxs,
                log.head.leftover_bytes.get(),
                init_bitmap,
            );
            if !log.advance(file.mtable())? {
                return Ok(());
            }
        }
    }

    /// Grows the table to the next power of two covering `end_vidx`, so
    /// growth cost amortizes to O(1) per applied block.
    fn resize_to_fit(table: &mut Vec<LogicalBlockIdx>, end_vidx: VirtualBlockIdx) {
        if (table.len() as u32) >= end_vidx {
            return;
        }
        table.resize((end_vidx as usize).next_power_of_two(), 0);
    }
}

impl Default for BlkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_rounds_to_powers_of_two() {
        let mut table = Vec::new();

        BlkTable::resize_to_fit(&mut table, 3);
        assert_eq!(table.len(), 4);

        BlkTable::resize_to_fit(&mut table, 4);
        assert_eq!(table.len(), 4);

        BlkTable::resize_to_fit(&mut table, 5);
        assert_eq!(table.len(), 8);

        BlkTable::resize_to_fit(&mut table, 1000);
        assert_eq!(table.len(), 1024);
    }

    #[test]
    fn empty_table_reads_as_holes() {
        let table = BlkTable::new();

        assert_eq!(table.get(0), 0);
        assert_eq!(table.get(12345), 0);
        assert!(table.snapshot_range(100, 4).iter().all(|&l| l == 0));
    }
}
