//! # Log Entries
//!
//! An indirect commit points at a chain of log entries describing the
//! write's block mapping. Entries live in per-thread log-entry blocks: 4 KiB
//! pools carved into 8-byte slots, so a slot index fits the 9-bit field of
//! an indirect tx entry.
//!
//! Each entry is a fixed 16-byte head followed by its logical run starts,
//! 4 bytes each, padded to a whole number of slots:
//!
//! ```text
//! +----+----------+----------------+----------+------------+------------+----------------+
//! | op | has_next | next_local_idx | leftover | num_blocks | begin_vidx | next_block_idx |
//! | u8 |    u8    |      u16       |   u16    |    u16     |    u32     |      u32       |
//! +----+----------+----------------+----------+------------+------------+----------------+
//! | begin_lidxs[0] | begin_lidxs[1] | ...                     (padded to 8-byte slots)   |
//! +---------------------------------------------------------------------------------------+
//! ```
//!
//! Every run except the last covers exactly 64 virtual blocks
//! (`MAX_BLOCKS_PER_BODY`), so the run count is derived from `num_blocks`
//! rather than stored. A chained entry stores `leftover_bytes = 0`; only the
//! terminal entry carries the real value. `next_block_idx == 0` means the
//! next entry lives in the same block at `next_local_idx`.
//!
//! Entries are zeroed at allocation and fully written before the commit
//! entry that references them is published, so replay never observes a
//! partially written entry as valid.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BLOCK_SIZE, LOG_SLOT_SIZE, MAX_BLOCKS_PER_BODY, NUM_LOG_SLOTS};
use crate::error::FsError;

/// The only logged operation: replace the mapping of a virtual range.
pub const LOG_OP_OVERWRITE: u8 = 1;

/// Slots occupied by the fixed head.
pub const LOG_HEAD_SLOTS: usize = 2;

/// Most logical runs one entry can carry; 64 runs cover 64 * 64 = 4096
/// virtual blocks. Larger writes chain entries.
pub const MAX_LIDXS_PER_ENTRY: usize = 64;

/// Fixed 16-byte head of a log entry.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct LogEntryHead {
    pub op: u8,
    pub has_next: u8,
    pub next_local_idx: U16,
    pub leftover_bytes: U16,
    pub num_blocks: U16,
    pub begin_vidx: U32,
    pub next_block_idx: U32,
}

const _: () = assert!(std::mem::size_of::<LogEntryHead>() == LOG_HEAD_SLOTS * LOG_SLOT_SIZE);

/// Slots occupied by an entry carrying `num_lidxs` runs.
pub fn entry_slots(num_lidxs: usize) -> usize {
    LOG_HEAD_SLOTS + (num_lidxs * 4).div_ceil(LOG_SLOT_SIZE)
}

impl LogEntryHead {
    /// Runs carried by this entry: one per 64 covered blocks.
    pub fn num_lidxs(&self) -> usize {
        (self.num_blocks.get() as u32).div_ceil(MAX_BLOCKS_PER_BODY) as usize
    }

    /// Decodes and sanity-checks the head at slot `local_idx` of a log-entry
    /// block.
    pub fn decode(block: &[u8], local_idx: u16) -> Result<LogEntryHead> {
        let off = slot_offset(block, local_idx, LOG_HEAD_SLOTS)?;
        let head = LogEntryHead::read_from_bytes(&block[off..off + std::mem::size_of::<Self>()])
            .expect("slice length matches head size");
        ensure!(
            head.op == LOG_OP_OVERWRITE,
            FsError::Corruption(format!("log entry with unknown op {}", head.op))
        );
        ensure!(
            head.num_blocks.get() >= 1 && head.num_lidxs() <= MAX_LIDXS_PER_ENTRY,
            FsError::Corruption(format!(
                "log entry covering {} blocks",
                head.num_blocks.get()
            ))
        );
        slot_offset(block, local_idx, entry_slots(head.num_lidxs()))?;
        Ok(head)
    }

    /// Decodes the run starts following the head at `local_idx`.
    pub fn decode_lidxs(&self, block: &[u8], local_idx: u16, out: &mut Vec<u32>) -> Result<()> {
        let n = self.num_lidxs();
        let off = slot_offset(block, local_idx, entry_slots(n))? + LOG_HEAD_SLOTS * LOG_SLOT_SIZE;
        for i in 0..n {
            let at = off + i * 4;
            out.push(u32::from_le_bytes(block[at..at + 4].try_into().unwrap()));
        }
        Ok(())
    }
}

/// Writes a freshly allocated entry: head plus run starts.
///
/// # Safety
///
/// `base` must point at a mapped 4 KiB log-entry block owned exclusively by
/// the calling thread's allocator, and the entry at `local_idx` must fit the
/// block (guaranteed by the allocator that handed the slot out).
pub unsafe fn write_entry(base: *mut u8, local_idx: u16, head: &LogEntryHead, lidxs: &[u32]) {
    debug_assert_eq!(head.num_lidxs(), lidxs.len());
    debug_assert!(local_idx as usize + entry_slots(lidxs.len()) <= NUM_LOG_SLOTS);
    let off = local_idx as usize * LOG_SLOT_SIZE;
    // SAFETY: the range stays inside the block per the allocator's slot
    // accounting; no reader sees it until the commit entry is published.
    unsafe {
        std::ptr::copy_nonoverlapping(
            head.as_bytes().as_ptr(),
            base.add(off),
            std::mem::size_of::<LogEntryHead>(),
        );
        let body = base.add(off + LOG_HEAD_SLOTS * LOG_SLOT_SIZE);
        for (i, lidx) in lidxs.iter().enumerate() {
            std::ptr::copy_nonoverlapping(lidx.to_le_bytes().as_ptr(), body.add(i * 4), 4);
        }
    }
}

/// Patches the chain link of an already-written (but unpublished) entry at
/// `prev_local_idx` to point at the next entry.
///
/// # Safety
///
/// Same contract as [`write_entry`]; the previous entry must not have been
/// published yet.
pub unsafe fn link_next(
    prev_base: *mut u8,
    prev_local_idx: u16,
    next_block_idx: u32,
    next_local_idx: u16,
) {
    let off = prev_local_idx as usize * LOG_SLOT_SIZE;
    // SAFETY: field offsets within the head of a live, thread-owned entry.
    unsafe {
        *prev_base.add(off + 1) = 1; // has_next
        std::ptr::copy_nonoverlapping(
            next_local_idx.to_le_bytes().as_ptr(),
            prev_base.add(off + 2),
            2,
        );
        std::ptr::copy_nonoverlapping(
            next_block_idx.to_le_bytes().as_ptr(),
            prev_base.add(off + 12),
            4,
        );
    }
}

fn slot_offset(block: &[u8], local_idx: u16, slots: usize) -> Result<usize> {
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    ensure!(
        (local_idx as usize) + slots <= NUM_LOG_SLOTS,
        FsError::Corruption(format!("log entry at slot {local_idx} overruns its block"))
    );
    Ok(local_idx as usize * LOG_SLOT_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(num_blocks: u16, begin_vidx: u32, leftover: u16) -> LogEntryHead {
        LogEntryHead {
            op: LOG_OP_OVERWRITE,
            has_next: 0,
            next_local_idx: U16::new(0),
            leftover_bytes: U16::new(leftover),
            num_blocks: U16::new(num_blocks),
            begin_vidx: U32::new(begin_vidx),
            next_block_idx: U32::new(0),
        }
    }

    #[test]
    fn head_is_two_slots() {
        assert_eq!(std::mem::size_of::<LogEntryHead>(), 16);
        assert_eq!(entry_slots(1), 3);
        assert_eq!(entry_slots(2), 3);
        assert_eq!(entry_slots(3), 4);
        assert_eq!(entry_slots(64), 34);
    }

    #[test]
    fn run_count_derives_from_num_blocks() {
        assert_eq!(head(1, 0, 0).num_lidxs(), 1);
        assert_eq!(head(64, 0, 0).num_lidxs(), 1);
        assert_eq!(head(65, 0, 0).num_lidxs(), 2);
        assert_eq!(head(130, 0, 0).num_lidxs(), 3);
    }

    #[test]
    fn write_then_decode_roundtrip() {
        let mut block = vec![0u8; BLOCK_SIZE];
        let h = head(130, 7, 123);
        let lidxs = [100, 200, 300];

        // SAFETY: block is a live, exclusively owned buffer.
        unsafe { write_entry(block.as_mut_ptr(), 10, &h, &lidxs) };

        let decoded = LogEntryHead::decode(&block, 10).unwrap();
        assert_eq!(decoded, h);

        let mut runs = Vec::new();
        decoded.decode_lidxs(&block, 10, &mut runs).unwrap();
        assert_eq!(runs, lidxs);
    }

    #[test]
    fn link_next_patches_chain_fields() {
        let mut block = vec![0u8; BLOCK_SIZE];
        let h = head(64, 0, 0);
        // SAFETY: live exclusive buffer.
        unsafe {
            write_entry(block.as_mut_ptr(), 0, &h, &[50]);
            link_next(block.as_mut_ptr(), 0, 99, 300);
        }

        let decoded = LogEntryHead::decode(&block, 0).unwrap();
        assert_eq!(decoded.has_next, 1);
        assert_eq!(decoded.next_local_idx.get(), 300);
        assert_eq!(decoded.next_block_idx.get(), 99);
    }

    #[test]
    fn decode_rejects_unknown_op() {
        let block = vec![0u8; BLOCK_SIZE];

        assert!(LogEntryHead::decode(&block, 0).is_err());
    }

    #[test]
    fn decode_rejects_overrun() {
        let mut block = vec![0u8; BLOCK_SIZE];
        let h = head(1, 0, 0);
        let last_fitting = (NUM_LOG_SLOTS - entry_slots(1)) as u16;
        // SAFETY: live exclusive buffer.
        unsafe { write_entry(block.as_mut_ptr(), last_fitting, &h, &[5]) };

        assert!(LogEntryHead::decode(&block, last_fitting).is_ok());
        assert!(LogEntryHead::decode(&block, (NUM_LOG_SLOTS - 1) as u16).is_err());
    }
}
