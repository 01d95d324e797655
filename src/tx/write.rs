//! # Write Paths
//!
//! All three write shapes share the same skeleton: reserve logical blocks,
//! fill them, persist, fence, commit. They differ in how much of the old
//! mapping they must carry over:
//!
//! - aligned writes carry nothing and commit without optimistic
//!   concurrency;
//! - single-block and multi-block unaligned writes copy the untouched bytes
//!   of the affected edge blocks from the current mapping, so a competing
//!   commit to an intersecting range invalidates the copy and forces a
//!   retry with the refreshed mapping.
//!
//! Blocks replaced by a committed write are recycled into the thread's
//! volatile free list; blocks prepared by an abandoned attempt go back the
//! same way.

use eyre::Result;
use smallvec::SmallVec;

use crate::alloc::Allocator;
use crate::config::{BLOCK_SHIFT, BLOCK_SIZE, MAX_ALLOC_BLOCKS};
use crate::file::File;
use crate::layout::{LogicalBlockIdx, TxEntry, VirtualBlockIdx};
use crate::offset::Ticket;
use crate::pmem;
use crate::tx::{append_log_entry, commit_entry, leftover_bytes, run_lidx_at, Commit};

/// Classifies and executes one write.
pub(crate) fn dispatch(
    file: &File,
    allocator: &mut Allocator,
    buf: &[u8],
    offset: u64,
    turn: Option<&Ticket>,
) -> Result<()> {
    let count = buf.len();
    if count % BLOCK_SIZE == 0 && offset % BLOCK_SIZE as u64 == 0 {
        aligned_write(file, allocator, buf, offset, turn)
    } else if offset >> BLOCK_SHIFT == (offset + count as u64 - 1) >> BLOCK_SHIFT {
        single_block_write(file, allocator, buf, offset, turn)
    } else {
        multi_block_write(file, allocator, buf, offset, turn)
    }
}

/// Reserves `num_blocks` logical blocks as stride-64 runs (the shape log
/// entries and the block table expect).
fn alloc_runs(
    allocator: &mut Allocator,
    file: &File,
    num_blocks: u32,
) -> Result<SmallVec<[LogicalBlockIdx; 4]>> {
    let mut runs: SmallVec<[LogicalBlockIdx; 4]> = SmallVec::new();
    let mut left = num_blocks;
    while left > 0 {
        let n = left.min(MAX_ALLOC_BLOCKS);
        match allocator.alloc(n, file.bitmaps()) {
            Ok(start) => runs.push(start),
            Err(report) => {
                // abandon: every run reserved so far was a full word
                for &run in &runs {
                    allocator.free(run, MAX_ALLOC_BLOCKS);
                }
                return Err(report);
            }
        }
        left -= n;
    }
    Ok(runs)
}

/// Copies `src` into the data block at `lidx` starting at `at`, without
/// persisting.
fn fill_block(file: &File, lidx: LogicalBlockIdx, at: usize, src: &[u8]) -> Result<()> {
    debug_assert!(at + src.len() <= BLOCK_SIZE);
    let dst = file.mtable().get_addr(lidx)?;
    // SAFETY: the block was reserved by this thread and is unpublished, so
    // no other thread reads or writes it.
    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(at), src.len());
    }
    Ok(())
}

/// Copies `range` of the old block at `old_lidx` (zeros for a hole) into the
/// same range of the new block.
fn carry_over(
    file: &File,
    new_lidx: LogicalBlockIdx,
    old_lidx: LogicalBlockIdx,
    range: std::ops::Range<usize>,
) -> Result<()> {
    if range.is_empty() {
        return Ok(());
    }
    let dst = file.mtable().get_addr(new_lidx)?;
    // SAFETY: the new block is unpublished and thread-owned; the old block,
    // if any, is a committed immutable block.
    unsafe {
        match old_lidx {
            0 => std::ptr::write_bytes(dst.add(range.start), 0, range.len()),
            _ => {
                let src = file.mtable().get_addr(old_lidx)?;
                std::ptr::copy_nonoverlapping(
                    src.add(range.start),
                    dst.add(range.start),
                    range.len(),
                );
            }
        }
    }
    Ok(())
}

fn persist_block(file: &File, lidx: LogicalBlockIdx) -> Result<()> {
    let ptr = file.mtable().get_addr(lidx)?;
    // SAFETY: one whole mapped block.
    unsafe { pmem::persist_unfenced(ptr, BLOCK_SIZE) };
    Ok(())
}

/// Block-aligned overwrite: fill fresh blocks from the payload and commit.
/// No read-modify-write, hence no optimistic concurrency.
fn aligned_write(
    file: &File,
    allocator: &mut Allocator,
    buf: &[u8],
    offset: u64,
    turn: Option<&Ticket>,
) -> Result<()> {
    let num_blocks = (buf.len() >> BLOCK_SHIFT) as u32;
    let begin_vidx = (offset >> BLOCK_SHIFT) as VirtualBlockIdx;
    let runs = alloc_runs(allocator, file, num_blocks)?;

    for i in 0..num_blocks {
        let lidx = run_lidx_at(&runs, i);
        let src = &buf[(i as usize) << BLOCK_SHIFT..][..BLOCK_SIZE];
        fill_block(file, lidx, 0, src)?;
        persist_block(file, lidx)?;
    }

    let state = file
        .blk_table()
        .update(file, true, false, Some(allocator))?;
    let old = file.blk_table().snapshot_range(begin_vidx, num_blocks);

    let entry = if runs.len() == 1 && TxEntry::fits_inline(num_blocks, begin_vidx) {
        TxEntry::inline(num_blocks, begin_vidx, runs[0])
    } else {
        let (log_block, log_local) =
            append_log_entry(file, allocator, 0, num_blocks, begin_vidx, &runs)?;
        TxEntry::indirect(0, log_block, log_local)
    };

    if let Some(ticket) = turn {
        file.tx().offset.wait_turn(ticket);
    }
    pmem::fence();
    match commit_entry(file, allocator, entry, state.cursor, None)? {
        Commit::Done(_) => {}
        Commit::Conflict => unreachable!("aligned commits do not check conflicts"),
    }
    file.blk_table().update(file, true, false, Some(allocator))?;
    allocator.free_image(&old);
    Ok(())
}

/// Copy-on-write of a single virtual block under optimistic concurrency.
fn single_block_write(
    file: &File,
    allocator: &mut Allocator,
    buf: &[u8],
    offset: u64,
    turn: Option<&Ticket>,
) -> Result<()> {
    let vidx = (offset >> BLOCK_SHIFT) as VirtualBlockIdx;
    let in_off = (offset % BLOCK_SIZE as u64) as usize;
    let write_end = offset + buf.len() as u64;

    let new_lidx = allocator.alloc(1, file.bitmaps())?;
    let mut state = file
        .blk_table()
        .update(file, true, false, Some(allocator))?;

    loop {
        let old_lidx = file.blk_table().get(vidx);
        carry_over(file, new_lidx, old_lidx, 0..in_off)?;
        fill_block(file, new_lidx, in_off, buf)?;
        carry_over(file, new_lidx, old_lidx, in_off + buf.len()..BLOCK_SIZE)?;
        persist_block(file, new_lidx)?;

        let leftover = leftover_bytes(vidx, write_end, state.file_size);
        let entry = if leftover == 0 && TxEntry::fits_inline(1, vidx) {
            TxEntry::inline(1, vidx, new_lidx)
        } else {
            let (log_block, log_local) =
                append_log_entry(file, allocator, leftover, 1, vidx, &[new_lidx])?;
            TxEntry::indirect(leftover, log_block, log_local)
        };

        if let Some(ticket) = turn {
            file.tx().offset.wait_turn(ticket);
        }
        pmem::fence();
        match commit_entry(file, allocator, entry, state.cursor, Some((vidx, 1)))? {
            Commit::Done(_) => {
                file.blk_table().update(file, true, false, Some(allocator))?;
                allocator.free(old_lidx, 1);
                return Ok(());
            }
            Commit::Conflict => {
                // an intersecting commit got in first; refresh the mapping
                // and redo the copy with the winner's data
                state = file
                    .blk_table()
                    .update(file, true, false, Some(allocator))?;
            }
        }
    }
}

/// Unaligned write spanning several blocks: copy-on-write head and tail,
/// payload-only middle, one commit entry for the whole range.
fn multi_block_write(
    file: &File,
    allocator: &mut Allocator,
    buf: &[u8],
    offset: u64,
    turn: Option<&Ticket>,
) -> Result<()> {
    let write_end = offset + buf.len() as u64;
    let begin_vidx = (offset >> BLOCK_SHIFT) as VirtualBlockIdx;
    let end_vidx = ((write_end - 1) >> BLOCK_SHIFT) as VirtualBlockIdx;
    let num_blocks = end_vidx - begin_vidx + 1;
    let in_off = (offset % BLOCK_SIZE as u64) as usize;
    // bytes of the last block covered by the payload
    let tail_cov = (write_end - ((end_vidx as u64) << BLOCK_SHIFT)) as usize;

    let runs = alloc_runs(allocator, file, num_blocks)?;

    // payload parts never change across retries: copy them once
    for i in 0..num_blocks {
        let lidx = run_lidx_at(&runs, i);
        let block_start = ((begin_vidx + i) as u64) << BLOCK_SHIFT;
        let from = offset.max(block_start);
        let to = write_end.min(block_start + BLOCK_SIZE as u64);
        let at = (from - block_start) as usize;
        let src = &buf[(from - offset) as usize..(to - offset) as usize];
        fill_block(file, lidx, at, src)?;
        if i != 0 && i != num_blocks - 1 {
            persist_block(file, lidx)?;
        }
    }

    let head_lidx = run_lidx_at(&runs, 0);
    let tail_lidx = run_lidx_at(&runs, num_blocks - 1);
    let mut state = file
        .blk_table()
        .update(file, true, false, Some(allocator))?;

    loop {
        let old = file.blk_table().snapshot_range(begin_vidx, num_blocks);
        carry_over(file, head_lidx, old[0], 0..in_off)?;
        carry_over(
            file,
            tail_lidx,
            old[(num_blocks - 1) as usize],
            tail_cov..BLOCK_SIZE,
        )?;
        persist_block(file, head_lidx)?;
        persist_block(file, tail_lidx)?;

        let leftover = leftover_bytes(end_vidx, write_end, state.file_size);
        let entry = if runs.len() == 1
            && leftover == 0
            && TxEntry::fits_inline(num_blocks, begin_vidx)
        {
            TxEntry::inline(num_blocks, begin_vidx, runs[0])
        } else {
            let (log_block, log_local) =
                append_log_entry(file, allocator, leftover, num_blocks, begin_vidx, &runs)?;
            TxEntry::indirect(leftover, log_block, log_local)
        };

        if let Some(ticket) = turn {
            file.tx().offset.wait_turn(ticket);
        }
        pmem::fence();
        match commit_entry(
            file,
            allocator,
            entry,
            state.cursor,
            Some((begin_vidx, num_blocks)),
        )? {
            Commit::Done(_) => {
                file.blk_table().update(file, true, false, Some(allocator))?;
                allocator.free_image(&old);
                return Ok(());
            }
            Commit::Conflict => {
                state = file
                    .blk_table()
                    .update(file, true, false, Some(allocator))?;
            }
        }
    }
}
