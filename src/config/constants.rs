//! # Layout Constants
//!
//! This module centralizes the persistent-layout constants, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch
//! bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> BLOCK_SHIFT (12, log2 of BLOCK_SIZE)
//!       │
//!       ├─> NUM_BITMAP_PER_BLOCK (512 words of 64 bits each)
//!       │     One bitmap block covers 512 * 64 = 32768 logical blocks.
//!       │
//!       ├─> NUM_TX_ENTRY (511)
//!       │     A tx-log block is {prev, next} + 511 eight-byte entry slots.
//!       │
//!       └─> NUM_LOG_SLOTS (512)
//!             A log-entry block is a pool of 512 eight-byte slots.
//!
//! CACHELINE_SIZE (64 bytes)
//!       │
//!       ├─> NUM_INLINE_BITMAP (16 words = 2 cache lines in the meta block)
//!       │     The inline bitmaps cover the first 1024 logical blocks.
//!       │
//!       └─> NUM_INLINE_TX_ENTRY (480 = 60 cache lines in the meta block)
//!             MetaBlock = 1 CL header + 1 CL lock + 2 CL bitmaps + 60 CL
//!             tx entries = 64 CL = BLOCK_SIZE.
//!
//! NUM_BITMAP_BLOCKS (4)
//!       │
//!       └─> TOTAL_NUM_BITMAP_WORDS / TOTAL_NUM_BITMAP_BYTES
//!             Also sizes the bitmap cache at the head of the shared-memory
//!             region, which is why the count is compile-time fixed.
//!
//! MAX_NUM_THREADS (128) and SHM_PER_THREAD_SIZE (64)
//!       │
//!       └─> SHM_SIZE = bitmap cache + per-thread slots, page aligned
//! ```

/// Size of every persistent block.
pub const BLOCK_SIZE: usize = 4096;

/// log2 of [`BLOCK_SIZE`].
pub const BLOCK_SHIFT: u32 = 12;

/// Cache line size the meta-block layout is built around.
pub const CACHELINE_SIZE: usize = 64;

/// Blocks covered by one 64-bit bitmap word.
pub const BITMAP_WORD_CAPACITY: u32 = 64;

/// 64-bit bitmap words per bitmap block.
pub const NUM_BITMAP_PER_BLOCK: usize = BLOCK_SIZE / 8;

/// Bitmap blocks following the meta block. Fixed at creation time because the
/// shared-memory bitmap cache is sized from it.
pub const NUM_BITMAP_BLOCKS: u32 = 4;

/// Inline bitmap words in the meta block (cache lines 2-3).
pub const NUM_INLINE_BITMAP: usize = 2 * (CACHELINE_SIZE / 8);

/// Inline tx entry slots in the meta block (cache lines 4-63).
pub const NUM_INLINE_TX_ENTRY: usize = 60 * (CACHELINE_SIZE / 8);

/// Tx entry slots per tx-log block ({prev, next} header takes one slot).
pub const NUM_TX_ENTRY: usize = (BLOCK_SIZE - 8) / 8;

/// Allocation unit of a log-entry block, in bytes.
pub const LOG_SLOT_SIZE: usize = 8;

/// Eight-byte slots per log-entry block.
pub const NUM_LOG_SLOTS: usize = BLOCK_SIZE / LOG_SLOT_SIZE;

/// Virtual blocks covered by one logical run in a log entry body.
pub const MAX_BLOCKS_PER_BODY: u32 = 64;

/// Bitmap words addressable by the allocator: inline words plus the words of
/// every bitmap block.
pub const TOTAL_NUM_BITMAP_WORDS: usize =
    NUM_INLINE_BITMAP + NUM_BITMAP_BLOCKS as usize * NUM_BITMAP_PER_BLOCK;

/// Byte size of the bitmap cache at the head of the shared-memory region.
pub const TOTAL_NUM_BITMAP_BYTES: usize = TOTAL_NUM_BITMAP_WORDS * 8;

/// Largest block count a write may pass to a single allocator call; larger
/// writes are split into runs of this size by the transaction manager.
pub const MAX_ALLOC_BLOCKS: u32 = BITMAP_WORD_CAPACITY;

/// Per-thread slots in the shared-memory region.
pub const MAX_NUM_THREADS: usize = 128;

/// Size of one per-thread record in shared memory (one cache line).
pub const SHM_PER_THREAD_SIZE: usize = CACHELINE_SIZE;

/// Total size of the shared-memory region, page aligned.
pub const SHM_SIZE: usize = (TOTAL_NUM_BITMAP_BYTES
    + MAX_NUM_THREADS * SHM_PER_THREAD_SIZE
    + (BLOCK_SIZE - 1))
    & !(BLOCK_SIZE - 1);

/// Extended attribute on the backing file that records the shared-memory
/// object path.
pub const SHM_XATTR_NAME: &[u8] = b"user.shm_path\0";

/// Longest shared-memory path we store in the xattr, NUL included.
pub const SHM_PATH_LEN: usize = 64;

/// Meta-block signature, NUL padded to 16 bytes.
pub const SIGNATURE: [u8; 16] = *b"ULAYFS\0\0\0\0\0\0\0\0\0\0";

/// Largest block count an inline tx entry can describe (6-bit field).
pub const TX_INLINE_MAX_BLOCKS: u32 = (1 << 6) - 1;

/// Largest virtual block index an inline tx entry can describe (22-bit field).
pub const TX_INLINE_MAX_VIDX: u32 = (1 << 22) - 1;

/// Default growth quantum: 2 MiB, the transparent-hugepage granule.
pub const DEFAULT_GROW_UNIT_SHIFT: u32 = 21;

const _: () = assert!(BLOCK_SIZE == 1 << BLOCK_SHIFT);
const _: () = assert!(NUM_INLINE_BITMAP * 8 == 2 * CACHELINE_SIZE);
const _: () = assert!(NUM_INLINE_TX_ENTRY * 8 == 60 * CACHELINE_SIZE);
const _: () = assert!(
    2 * CACHELINE_SIZE + NUM_INLINE_BITMAP * 8 + NUM_INLINE_TX_ENTRY * 8 == BLOCK_SIZE
);
const _: () = assert!(NUM_TX_ENTRY == 511);
const _: () = assert!(SHM_SIZE % BLOCK_SIZE == 0);
const _: () = assert!(TOTAL_NUM_BITMAP_BYTES % CACHELINE_SIZE == 0);
