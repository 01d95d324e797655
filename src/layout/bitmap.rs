//! # Persistent Block Bitmaps
//!
//! Allocation state is kept in 64-bit bitmap words, one bit per logical
//! block, 0 = free and 1 = used. The first 16 words live inline in the meta
//! block (covering logical blocks 0..1024); every bitmap block after the
//! meta block adds 512 more words (32768 blocks).
//!
//! All mutation is lock-free compare-and-swap on the word; no lock protects
//! the bitmaps. A word is the batch-allocation granule: the allocator claims
//! whole free words (64 contiguous blocks) and carves them up from its
//! volatile free list.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::config::{BITMAP_WORD_CAPACITY, NUM_BITMAP_PER_BLOCK, NUM_INLINE_BITMAP};
use crate::error::FsError;
use crate::layout::LogicalBlockIdx;

pub const BITMAP_ALL_USED: u64 = u64::MAX;

/// One 64-bit allocation word covering 64 logical blocks.
#[repr(transparent)]
pub struct Bitmap {
    word: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<Bitmap>() == 8);

impl Bitmap {
    pub fn load(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Atomically claims the lowest free bit; returns its index, or `None`
    /// when the word is exhausted.
    pub fn alloc_one(&self) -> Option<u32> {
        let mut b = self.word.load(Ordering::Acquire);
        loop {
            if b == BITMAP_ALL_USED {
                return None;
            }
            let claimed = (!b) & (b + 1); // lowest zero bit as a mask
            match self.word.compare_exchange_weak(
                b,
                b | claimed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(claimed.trailing_zeros()),
                Err(seen) => b = seen,
            }
        }
    }

    /// Atomically claims all 64 blocks of a fully free word.
    pub fn alloc_all(&self) -> bool {
        self.word.load(Ordering::Acquire) == 0
            && self
                .word
                .compare_exchange(0, BITMAP_ALL_USED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn set_allocated(&self, bit: u32) {
        debug_assert!(bit < BITMAP_WORD_CAPACITY);
        self.word.fetch_or(1u64 << bit, Ordering::AcqRel);
    }

    pub fn is_allocated(&self, bit: u32) -> bool {
        debug_assert!(bit < BITMAP_WORD_CAPACITY);
        self.load() & (1u64 << bit) != 0
    }

    pub fn store(&self, value: u64) {
        self.word.store(value, Ordering::Release);
    }
}

/// View over every persistent bitmap word of one file: the inline words in
/// the meta block plus the words of each bitmap block.
///
/// Constructed once per open from mapping addresses that stay valid for the
/// lifetime of the file, so the stored pointers never dangle.
pub struct BitmapSet {
    inline: *const Bitmap,
    blocks: SmallVec<[*const Bitmap; 8]>,
}

// SAFETY: every word behind the pointers is an atomic mutated only through
// CAS; the mappings outlive the set (owned by the same `File`).
unsafe impl Send for BitmapSet {}
unsafe impl Sync for BitmapSet {}

impl BitmapSet {
    /// # Safety
    ///
    /// `inline` must point at [`NUM_INLINE_BITMAP`] words and every entry of
    /// `blocks` at [`NUM_BITMAP_PER_BLOCK`] words, all inside mappings that
    /// outlive the returned set.
    pub unsafe fn from_raw_parts(
        inline: *const Bitmap,
        blocks: SmallVec<[*const Bitmap; 8]>,
    ) -> Self {
        Self { inline, blocks }
    }

    /// Total addressable bitmap words.
    pub fn num_words(&self) -> usize {
        NUM_INLINE_BITMAP + self.blocks.len() * NUM_BITMAP_PER_BLOCK
    }

    /// Total addressable logical blocks.
    pub fn capacity_blocks(&self) -> u32 {
        (self.num_words() as u32) * BITMAP_WORD_CAPACITY
    }

    /// The word at global index `idx` (inline words first, then bitmap
    /// blocks in file order).
    pub fn word(&self, idx: usize) -> &Bitmap {
        debug_assert!(idx < self.num_words());
        // SAFETY: idx is in range per the constructor contract; the mapping
        // outlives `self`.
        unsafe {
            if idx < NUM_INLINE_BITMAP {
                &*self.inline.add(idx)
            } else {
                let rel = idx - NUM_INLINE_BITMAP;
                &*self.blocks[rel / NUM_BITMAP_PER_BLOCK].add(rel % NUM_BITMAP_PER_BLOCK)
            }
        }
    }

    /// First logical block covered by global word `idx`.
    pub fn first_block_of_word(idx: usize) -> LogicalBlockIdx {
        (idx as u32) * BITMAP_WORD_CAPACITY
    }

    /// Claims one fully free word, scanning from `hint_word` and wrapping
    /// once. Returns the claimed word index.
    pub fn alloc_batch(&self, hint_word: usize) -> Result<usize, FsError> {
        let n = self.num_words();
        let hint = hint_word.min(n);
        for idx in (hint..n).chain(0..hint) {
            if self.word(idx).alloc_all() {
                return Ok(idx);
            }
        }
        Err(FsError::NoSpace)
    }

    pub fn set_allocated(&self, lidx: LogicalBlockIdx) {
        let (word, bit) = Self::locate(lidx);
        self.word(word).set_allocated(bit);
    }

    pub fn is_allocated(&self, lidx: LogicalBlockIdx) -> bool {
        let (word, bit) = Self::locate(lidx);
        self.word(word).is_allocated(bit)
    }

    /// Zeroes every word. Only used while rebuilding the bitmap from the
    /// committed log prefix, before any allocator runs against the file.
    pub fn clear_all(&self) {
        for idx in 0..self.num_words() {
            self.word(idx).store(0);
        }
    }

    fn locate(lidx: LogicalBlockIdx) -> (usize, u32) {
        (
            (lidx / BITMAP_WORD_CAPACITY) as usize,
            lidx % BITMAP_WORD_CAPACITY,
        )
    }
}
