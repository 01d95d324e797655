//! # Transaction Manager
//!
//! Every I/O entry point funnels through here. Writes are classified by
//! alignment:
//!
//! - **aligned**: block-aligned offset and count: fresh blocks are filled
//!   straight from the caller's buffer, no read-modify-write and no
//!   optimistic concurrency;
//! - **single-block**: the range lies inside one virtual block: copy-on-
//!   write of that block under optimistic concurrency;
//! - **multi-block unaligned**: copy-on-write head and tail plus an
//!   aligned middle, one commit entry for the whole range.
//!
//! The commit protocol is the same for all of them: persist the payload,
//! fence, then CAS the 64-bit commit entry into the first free tx slot. The
//! fence orders durability before visibility: a replayer that can see the
//! commit entry is guaranteed to read the committed bytes.
//!
//! Implicit-offset `read`/`write` additionally reserve their range through
//! the [`OffsetMgr`] ticket sequencer so file-position accounting has one
//! linear history.

mod cursor;
mod read;
mod write;

pub(crate) use cursor::{tx_block, LogCursor, TxCursor, TxEntryIdx};

use eyre::Result;
use zerocopy::little_endian::{U16, U32};

use crate::alloc::Allocator;
use crate::config::{BLOCK_SHIFT, LOG_SLOT_SIZE, MAX_BLOCKS_PER_BODY};
use crate::file::File;
use crate::layout::log_entry;
use crate::layout::{
    entry_slots, LogEntryHead, LogicalBlockIdx, TxEntry, TxEntryKind, VirtualBlockIdx,
    LOG_OP_OVERWRITE, MAX_LIDXS_PER_ENTRY,
};
use crate::offset::OffsetMgr;
use crate::pmem;

pub struct TxMgr {
    pub(crate) offset: OffsetMgr,
}

impl TxMgr {
    pub fn new() -> Self {
        Self {
            offset: OffsetMgr::new(),
        }
    }

    pub fn do_pread(&self, file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
        read::read_tx(file, buf, offset)
    }

    pub fn do_read(&self, file: &File, buf: &mut [u8]) -> Result<usize> {
        let state = file.blk_table().update(file, false, false, None)?;
        let ticket = self.offset.acquire(buf.len(), state.file_size, true);
        let result = read::read_tx(file, &mut buf[..ticket.count], ticket.offset);
        self.offset.wait_turn(&ticket);
        self.offset.retire(ticket);
        result
    }

    pub fn do_pwrite(&self, file: &File, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        file.with_allocator(|allocator| write::dispatch(file, allocator, buf, offset, None))?;
        Ok(buf.len())
    }

    pub fn do_write(&self, file: &File, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let ticket = self.offset.acquire(buf.len(), 0, false);
        let result = file.with_allocator(|allocator| {
            write::dispatch(file, allocator, buf, ticket.offset, Some(&ticket))
        });
        // the turn may not have been taken yet on error paths
        self.offset.wait_turn(&ticket);
        self.offset.retire(ticket);
        result?;
        Ok(buf.len())
    }
}

impl Default for TxMgr {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a commit attempt that watches for conflicting entries.
pub(crate) enum Commit {
    Done(TxEntryIdx),
    /// A competing transaction committed an intersecting range first; the
    /// caller must refresh its copy-on-write state and retry.
    Conflict,
}

/// Commits `entry` into the first empty slot at or after `start`, extending
/// the tx-log chain as needed.
///
/// With `check = Some((vidx, num_blocks))`, every already-committed entry
/// encountered on the way is tested for intersection with that virtual
/// range; an intersection aborts with [`Commit::Conflict`] instead of
/// committing a stale copy.
pub(crate) fn commit_entry(
    file: &File,
    allocator: &mut Allocator,
    entry: TxEntry,
    start: TxEntryIdx,
    check: Option<(VirtualBlockIdx, u32)>,
) -> Result<Commit> {
    let meta = file.meta();
    let mtable = file.mtable();
    let mut cursor = TxCursor::new(start);
    loop {
        if !cursor.ensure_in_block(meta, mtable, Some((allocator, file.bitmaps())))? {
            unreachable!("chain extension cannot report end-of-log");
        }

        // conflict-free commits in a tx-log block take the block's scan-and-
        // CAS fast path; conflict-checked commits walk slot by slot so every
        // competing entry passes through the intersection test
        if check.is_none() && cursor.idx.block_idx != 0 {
            let block = tx_block(mtable, cursor.idx.block_idx)?;
            match block.try_commit(entry, cursor.idx.local_idx as usize) {
                Some(local) => {
                    cursor.idx.local_idx = local as u32;
                    return Ok(finish_commit(file, &cursor, meta, mtable)?);
                }
                None => {
                    // block is full; fall through to chain extension
                    cursor.idx.local_idx = cursor.idx.capacity();
                    continue;
                }
            }
        }

        let slot = cursor.slot(meta, mtable)?;
        let existing = slot.load();
        if existing.is_valid() {
            if let Some((vidx, num_blocks)) = check {
                if entry_intersects(file, existing, vidx, num_blocks)? {
                    return Ok(Commit::Conflict);
                }
            }
            cursor.advance_slot();
            continue;
        }
        if slot.try_commit(entry) {
            return Ok(finish_commit(file, &cursor, meta, mtable)?);
        }
        // lost the slot race; the loop re-reads it as a committed entry
    }
}

/// Flushes the freshly published commit word and pins the containing tx
/// block for the committing thread.
fn finish_commit(
    file: &File,
    cursor: &TxCursor,
    meta: &crate::layout::MetaBlock,
    mtable: &crate::mtable::MemTable,
) -> Result<Commit> {
    let slot = cursor.slot(meta, mtable)?;
    // SAFETY: flushing the 8-byte slot that was just CAS-published.
    unsafe {
        pmem::persist_fenced(slot as *const crate::layout::TxEntrySlot as *const u8, 8);
    }
    file.try_pin_tx_block(cursor.idx.block_idx);
    Ok(Commit::Done(cursor.idx))
}

/// Whether any entry committed at or after `from` intersects
/// `[vidx, vidx + num_blocks)`. Used by the read path to validate an
/// optimistic copy against commits that landed while it ran.
pub(crate) fn range_committed_between(
    file: &File,
    from: TxEntryIdx,
    vidx: VirtualBlockIdx,
    num_blocks: u32,
) -> Result<bool> {
    let meta = file.meta();
    let mtable = file.mtable();
    let mut cursor = TxCursor::new(from);
    loop {
        if !cursor.ensure_in_block(meta, mtable, None)? {
            return Ok(false);
        }
        let entry = cursor.entry(meta, mtable)?;
        if !entry.is_valid() {
            return Ok(false);
        }
        if entry_intersects(file, entry, vidx, num_blocks)? {
            return Ok(true);
        }
        cursor.advance_slot();
    }
}

/// Whether a committed entry's virtual range intersects `[vidx, vidx + n)`.
fn entry_intersects(
    file: &File,
    entry: TxEntry,
    vidx: VirtualBlockIdx,
    num_blocks: u32,
) -> Result<bool> {
    let (begin, end) = match entry.kind() {
        TxEntryKind::Inline(e) => (e.begin_vidx, e.begin_vidx + e.num_blocks),
        TxEntryKind::Indirect(e) => {
            let mut log = LogCursor::load(file.mtable(), e.log_block_idx, e.log_local_idx)?;
            let mut begin = log.head.begin_vidx.get();
            let mut end = begin + log.head.num_blocks.get() as u32;
            while log.advance(file.mtable())? {
                begin = begin.min(log.head.begin_vidx.get());
                end = end.max(log.head.begin_vidx.get() + log.head.num_blocks.get() as u32);
            }
            (begin, end)
        }
        TxEntryKind::Dummy => return Ok(false),
        TxEntryKind::Invalid => return Ok(false),
    };
    Ok(begin < vidx + num_blocks && vidx < end)
}

/// Builds and persists a log-entry chain for one write: `begin_lidxs` holds
/// one run start per 64 covered blocks. Returns the chain head's position.
///
/// Non-terminal entries carry `leftover_bytes = 0`; only the terminal entry
/// stores the real value. Every entry is persisted before the commit entry
/// referencing the head can be published.
pub(crate) fn append_log_entry(
    file: &File,
    allocator: &mut Allocator,
    leftover_bytes: u16,
    num_blocks: u32,
    begin_vidx: VirtualBlockIdx,
    begin_lidxs: &[LogicalBlockIdx],
) -> Result<(LogicalBlockIdx, u16)> {
    debug_assert_eq!(
        begin_lidxs.len(),
        num_blocks.div_ceil(MAX_BLOCKS_PER_BODY) as usize
    );
    let mtable = file.mtable();
    let bitmaps = file.bitmaps();

    let mut head_pos: Option<(LogicalBlockIdx, u16)> = None;
    let mut prev: Option<(*mut u8, u16, LogicalBlockIdx, usize)> = None;
    let mut run_off = 0usize;
    let mut vidx = begin_vidx;
    let mut blocks_left = num_blocks;

    while blocks_left > 0 {
        let runs_here = begin_lidxs.len().min(run_off + MAX_LIDXS_PER_ENTRY) - run_off;
        let blocks_here = (runs_here as u32 * MAX_BLOCKS_PER_BODY).min(blocks_left);
        let slots = entry_slots(runs_here);
        let (block_idx, local_idx, base) =
            allocator.alloc_log_entry(slots, true, bitmaps, mtable)?;

        if let Some((prev_base, prev_local, prev_block, prev_slots)) = prev {
            let next_block = if prev_block == block_idx { 0 } else { block_idx };
            // SAFETY: the previous entry is still unpublished and owned by
            // this thread's slab.
            unsafe {
                log_entry::link_next(prev_base, prev_local, next_block, local_idx);
                pmem::persist_unfenced(
                    prev_base.add(prev_local as usize * LOG_SLOT_SIZE),
                    prev_slots * LOG_SLOT_SIZE,
                );
            }
        } else {
            head_pos = Some((block_idx, local_idx));
        }

        let is_last = blocks_here == blocks_left;
        let head = LogEntryHead {
            op: LOG_OP_OVERWRITE,
            has_next: 0,
            next_local_idx: U16::new(0),
            leftover_bytes: U16::new(if is_last { leftover_bytes } else { 0 }),
            num_blocks: U16::new(blocks_here as u16),
            begin_vidx: U32::new(vidx),
            next_block_idx: U32::new(0),
        };
        // SAFETY: the slot range was just reserved from this thread's slab.
        unsafe {
            log_entry::write_entry(
                base,
                local_idx,
                &head,
                &begin_lidxs[run_off..run_off + runs_here],
            );
        }

        prev = Some((base, local_idx, block_idx, slots));
        run_off += runs_here;
        vidx += blocks_here;
        blocks_left -= blocks_here;
    }

    let (prev_base, prev_local, _, prev_slots) = prev.expect("num_blocks >= 1");
    // SAFETY: flushing the terminal entry just written.
    unsafe {
        pmem::persist_unfenced(
            prev_base.add(prev_local as usize * LOG_SLOT_SIZE),
            prev_slots * LOG_SLOT_SIZE,
        );
    }
    Ok(head_pos.expect("num_blocks >= 1"))
}

/// Computes the `leftover_bytes` of a commit ending in virtual block
/// `end_vidx`: the bytes of that block past both the write and the current
/// end of file.
pub(crate) fn leftover_bytes(end_vidx: VirtualBlockIdx, write_end: u64, file_size: u64) -> u16 {
    let block_end = ((end_vidx as u64) + 1) << BLOCK_SHIFT;
    debug_assert!(write_end <= block_end);
    (block_end - file_size.max(write_end).min(block_end)) as u16
}

/// The logical block covering virtual position `i` within an allocation of
/// stride-64 runs.
pub(crate) fn run_lidx_at(begin_lidxs: &[LogicalBlockIdx], i: u32) -> LogicalBlockIdx {
    begin_lidxs[(i / MAX_BLOCKS_PER_BODY) as usize] + i % MAX_BLOCKS_PER_BODY
}
