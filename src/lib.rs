//! # ulayfs: crash-consistent files on persistent memory
//!
//! A user-space library that serves POSIX-style file I/O from a
//! memory-mapped persistent-memory region, with crash atomicity and
//! lock-free concurrency the kernel page cache cannot offer. Applications
//! (or a syscall shim in front of them) keep calling
//! `read`/`write`/`pread`/`pwrite`/`lseek`/`fsync`; the library serves core
//! files from the mapping and transparently passes everything else through
//! to the host.
//!
//! ## Quick start
//!
//! ```ignore
//! use ulayfs::File;
//!
//! let file = File::create("/mnt/pmem/data.bin")?;
//! file.pwrite(b"hello", 0)?;
//!
//! let mut buf = [0u8; 5];
//! file.pread(&mut buf, 0)?;
//! assert_eq!(&buf, b"hello");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 File (handle)                 │
//! ├───────────────┬───────────────┬───────────────┤
//! │    TxMgr      │   BlkTable    │    ShmMgr     │
//! │ commit paths  │ vidx→lidx by  │ liveness +    │
//! │ + OCC retry   │ log replay    │ bitmap cache  │
//! ├───────────────┴───────┬───────┴───────────────┤
//! │       Allocator       │       OffsetMgr       │
//! │ free list + bitmaps   │  ticketed positions   │
//! ├───────────────────────┴───────────────────────┤
//! │                   MemTable                    │
//! │        lazy grow-unit mmap of the file        │
//! ├───────────────────────────────────────────────┤
//! │   persistent layout: meta / bitmap / tx-log   │
//! │           / log-entry / data blocks           │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! On-file layout (4 KiB blocks):
//!
//! ```text
//! block 0       MetaBlock     signature, sizes, meta lock,
//!                             inline bitmaps, inline tx entries
//! block 1..B    BitmapBlock   allocation words (B fixed at creation)
//! block B+1...  interleaved   DataBlock | TxLogBlock | LogEntryBlock
//! ```
//!
//! ## Crash consistency
//!
//! A write reserves fresh blocks, fills and flushes them, fences, and then
//! publishes one 64-bit commit entry with a CAS into the append-only
//! transaction log. The commit word is the only visibility switch: before
//! it lands the write does not exist; after it lands the payload is already
//! durable. The volatile index (and the logical file size) is a pure
//! function of the committed log prefix, reconstructed by replay on every
//! open.
//!
//! ## Concurrency
//!
//! The common path is lock-free: bitmap claims and commit publication are
//! bounded CAS loops. Locks exist only at the edges: the robust
//! process-shared meta lock for file growth, and a short replay lock inside
//! the block table. Thread liveness is tracked through robust mutexes in a
//! shared-memory region, so a thread or process dying mid-transaction never
//! wedges the file: its half-done work stays invisible and its blocks are
//! reclaimed on the next bitmap rebuild.
//!
//! ## Module overview
//!
//! - [`layout`]: persistent block formats and their invariants
//! - `mtable`: lazy grow-unit mapping of the backing file
//! - `alloc`: per-thread block allocator and log-entry slabs
//! - `tx`: transaction manager, commit protocol and I/O paths
//! - `btable`: virtual→logical index rebuilt by log replay
//! - `shm`: shared-memory region (liveness, bitmap cache)
//! - [`config`]: layout constants and environment tunables

pub mod config;
pub mod error;
pub mod layout;

mod alloc;
mod btable;
mod file;
mod mtable;
mod offset;
mod pmem;
mod shm;
mod sync;
mod tx;

pub use config::Config;
pub use error::{report_errno, FsError};
pub use file::File;
