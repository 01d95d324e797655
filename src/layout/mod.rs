//! # Persistent Layout
//!
//! Every persistent structure lives in a 4 KiB block addressed by a
//! [`LogicalBlockIdx`], an index into the backing file. A separate
//! [`VirtualBlockIdx`] names a block position in the file image the
//! application sees; the block table maps virtual to logical.
//!
//! ```text
//! Idx: 0          1 .. B                   B+1 ...
//! +----------+----------------------+---------------------------------+
//! |   Meta   | BitmapBlock x B      | Data | TxLog | LogEntry | ...   |
//! +----------+----------------------+---------------------------------+
//! ```
//!
//! The blocks following the meta block are always the bitmap blocks; data,
//! tx-log and log-entry blocks are allocated on demand and interleave
//! freely after them.
//!
//! Blocks with concurrent writers (meta, bitmaps, tx logs) are `#[repr(C)]`
//! structs of atomics viewed in place inside the mapping; plain-data records
//! (log entries) are `zerocopy` little-endian structs.

mod bitmap;
pub(crate) mod log_entry;
mod meta;
mod tx_block;
mod tx_entry;

pub use bitmap::{Bitmap, BitmapSet, BITMAP_ALL_USED};
pub use log_entry::{
    entry_slots, LogEntryHead, LOG_HEAD_SLOTS, LOG_OP_OVERWRITE, MAX_LIDXS_PER_ENTRY,
};
pub use meta::MetaBlock;
pub use tx_block::TxLogBlock;
pub use tx_entry::{TxEntry, TxEntryIndirect, TxEntryInline, TxEntryKind, TxEntrySlot};

/// Offset in blocks within the backing file. Block 0 is the meta block.
pub type LogicalBlockIdx = u32;

/// Block position in the application-visible file image.
pub type VirtualBlockIdx = u32;
