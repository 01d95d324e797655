//! # Read Path
//!
//! Reads take a snapshot of the replayed state (the block table advanced to
//! the current log tail) and copy block by block. A virtual block with no
//! mapping is a hole and reads as zeros; a read past the end of file comes
//! back short.
//!
//! A block replaced by a later commit may be recycled and refilled while a
//! reader is still copying from it, so the copy is optimistic: after
//! copying, the read revalidates that no entry committed in the meantime
//! intersects its range, and redoes the copy from the fresh mapping if one
//! does. Commits are rare relative to reads, so the common case is a single
//! pass plus one tail check.

use eyre::Result;

use crate::config::{BLOCK_SHIFT, BLOCK_SIZE};
use crate::file::File;
use crate::tx::range_committed_between;

pub(crate) fn read_tx(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }

    loop {
        let state = file.blk_table().update(file, false, false, None)?;
        if offset >= state.file_size {
            return Ok(0);
        }
        let count = buf.len().min((state.file_size - offset) as usize);
        let end = offset + count as u64;

        let begin_vidx = (offset >> BLOCK_SHIFT) as u32;
        let end_vidx = ((end - 1) >> BLOCK_SHIFT) as u32;
        let num_blocks = end_vidx - begin_vidx + 1;
        let lidxs = file.blk_table().snapshot_range(begin_vidx, num_blocks);

        let mut copied = 0usize;
        for (i, &lidx) in lidxs.iter().enumerate() {
            let block_start = ((begin_vidx as u64) + i as u64) << BLOCK_SHIFT;
            let from = (offset.max(block_start) - block_start) as usize;
            let to = (end.min(block_start + BLOCK_SIZE as u64) - block_start) as usize;
            let dst = &mut buf[copied..copied + (to - from)];
            if lidx == 0 {
                dst.fill(0);
            } else {
                // SAFETY: the mapping outlives the file; the copy may race a
                // recycled block's refill, which the revalidation below
                // detects and retries.
                let block = unsafe { file.mtable().block_slice(lidx)? };
                dst.copy_from_slice(&block[from..to]);
            }
            copied += to - from;
        }
        debug_assert_eq!(copied, count);

        // the copy is only good if no commit intersecting the range landed
        // while it ran
        if !range_committed_between(file, state.cursor, begin_vidx, num_blocks)? {
            return Ok(count);
        }
    }
}
