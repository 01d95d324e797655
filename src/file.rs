//! # File Object
//!
//! The public handle. `open` wires the components together: memory table,
//! persistent bitmaps, block table, transaction manager, shared-memory
//! manager, per-thread allocators. The I/O methods forward to the
//! transaction manager.
//!
//! A file whose meta block does not carry the signature is served in
//! passthrough mode: every call goes to the host file descriptor unchanged,
//! so opening arbitrary files through this API is always safe.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::alloc::Allocator;
use crate::btable::BlkTable;
use crate::config::{Config, MAX_NUM_THREADS, NUM_BITMAP_BLOCKS};
use crate::error::FsError;
use crate::layout::{Bitmap, BitmapSet, LogicalBlockIdx, MetaBlock};
use crate::mtable::MemTable;
use crate::offset::SeekBase;
use crate::shm::ShmMgr;
use crate::tx::TxMgr;

/// The component bundle behind a verified core file.
struct Core {
    mtable: MemTable,
    bitmaps: BitmapSet,
    blk_table: BlkTable,
    tx: TxMgr,
    shm: ShmMgr,
    allocators: Box<[Mutex<Allocator>]>,
    /// Latched on the first corruption found during replay; writes then
    /// fail until the file is repaired offline.
    read_only: AtomicBool,
}

/// A crash-consistent file handle, or a transparent passthrough for files
/// that are not in the core format.
pub struct File {
    host: std::fs::File,
    /// `(st_dev, st_ino, shm incarnation)`: identity key for the per-thread
    /// slot cache. The shm component keeps a recreated region from reusing
    /// slot indexes cached against its previous incarnation.
    ident: (u64, u64, u64),
    core: Option<Core>,
}

impl File {
    /// Opens an existing file, stamping it as a core file if it is empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<File> {
        Self::open_impl(path.as_ref(), false)
    }

    /// Creates (or opens) a file in the core format.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<File> {
        Self::open_impl(path.as_ref(), true)
    }

    fn open_impl(path: &Path, create: bool) -> Result<File> {
        let host = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(FsError::Io)
            .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
        let md = host
            .metadata()
            .map_err(FsError::Io)
            .wrap_err("failed to stat file")?;
        let mut ident = (md.dev(), md.ino(), 0);

        if !md.file_type().is_file() {
            warn!(path = %path.display(), "not a regular file; serving through host I/O");
            return Ok(File {
                host,
                ident,
                core: None,
            });
        }
        if md.len() % crate::config::BLOCK_SIZE as u64 != 0 {
            warn!(path = %path.display(), "file size not block-aligned; serving through host I/O");
            return Ok(File {
                host,
                ident,
                core: None,
            });
        }

        let cfg = Config::from_env();
        let (mtable, created_file) = MemTable::init(
            host.try_clone().map_err(FsError::Io)?,
            cfg,
        )?;
        let meta = mtable.meta();
        if created_file {
            meta.init(meta.num_blocks(), NUM_BITMAP_BLOCKS)?;
        } else if !meta.verify_signature() {
            warn!(path = %path.display(), "no core signature; serving through host I/O");
            return Ok(File {
                host,
                ident,
                core: None,
            });
        }
        ensure!(
            meta.num_bitmap_blocks() == NUM_BITMAP_BLOCKS,
            FsError::Corruption(format!(
                "file carries {} bitmap blocks, build expects {}",
                meta.num_bitmap_blocks(),
                NUM_BITMAP_BLOCKS
            ))
        );

        let mut bitmap_blocks: SmallVec<[*const Bitmap; 8]> = SmallVec::new();
        for lidx in 1..=NUM_BITMAP_BLOCKS {
            bitmap_blocks.push(mtable.get_addr(lidx)? as *const Bitmap);
        }
        // SAFETY: the inline words live in the meta block and the bitmap
        // blocks right after it; all mappings outlive the bitmap set because
        // the same Core owns the mem table.
        let bitmaps = unsafe {
            BitmapSet::from_raw_parts(meta.inline_bitmaps().as_ptr(), bitmap_blocks)
        };

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fstat fills the stat buffer for a live fd.
        let rc = unsafe { libc::fstat(host.as_raw_fd(), &mut stat) };
        ensure!(rc == 0, FsError::Io(std::io::Error::last_os_error()));
        let shm = ShmMgr::open(host.as_raw_fd(), &stat)?;
        ident.2 = shm.region_id();

        let allocators = (0..MAX_NUM_THREADS)
            .map(|_| Mutex::new(Allocator::new()))
            .collect();
        let file = File {
            host,
            ident,
            core: Some(Core {
                mtable,
                bitmaps,
                blk_table: BlkTable::new(),
                tx: TxMgr::new(),
                shm,
                allocators,
                read_only: AtomicBool::new(false),
            }),
        };

        let core = file.core.as_ref().expect("core was just installed");
        let rebuild = core.shm.created();
        if rebuild {
            // fresh shared region: recompute liveness from the committed
            // prefix; anything the log cannot reach is free again
            file.meta().lock()?;
            core.bitmaps.clear_all();
            core.shm.cache_clear();
            for lidx in 0..=NUM_BITMAP_BLOCKS {
                file.set_allocated(lidx);
            }
            file.meta().unlock();
        }
        core.blk_table.update(&file, false, rebuild, None)?;
        Ok(file)
    }

    /// Whether this handle serves the core format (as opposed to
    /// passthrough host I/O).
    pub fn is_core(&self) -> bool {
        self.core.is_some()
    }

    /// Positional read.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match &self.core {
            Some(core) => core.tx.do_pread(self, buf, offset),
            None => {
                use std::os::unix::fs::FileExt;
                self.host
                    .read_at(buf, offset)
                    .map_err(FsError::Io)
                    .wrap_err("host pread failed")
            }
        }
    }

    /// Positional crash-atomic write.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        match &self.core {
            Some(core) => {
                self.check_writable(core)?;
                self.latch_corruption(core, core.tx.do_pwrite(self, buf, offset))
            }
            None => {
                use std::os::unix::fs::FileExt;
                self.host
                    .write_at(buf, offset)
                    .map_err(FsError::Io)
                    .wrap_err("host pwrite failed")
            }
        }
    }

    /// Implicit-offset read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match &self.core {
            Some(core) => core.tx.do_read(self, buf),
            None => {
                use std::io::Read;
                (&self.host)
                    .read(buf)
                    .map_err(FsError::Io)
                    .wrap_err("host read failed")
            }
        }
    }

    /// Implicit-offset crash-atomic write.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match &self.core {
            Some(core) => {
                self.check_writable(core)?;
                self.latch_corruption(core, core.tx.do_write(self, buf))
            }
            None => {
                use std::io::Write;
                (&self.host)
                    .write(buf)
                    .map_err(FsError::Io)
                    .wrap_err("host write failed")
            }
        }
    }

    /// Repositions the implicit offset.
    pub fn lseek(&self, pos: std::io::SeekFrom) -> Result<u64> {
        use std::io::SeekFrom;
        match &self.core {
            Some(core) => {
                let base = match pos {
                    SeekFrom::Start(off) => {
                        return core
                            .tx
                            .offset
                            .seek(SeekBase::Start, off as i64)
                            .ok_or_else(|| eyre::eyre!("seek to a negative offset"));
                    }
                    SeekFrom::Current(delta) => (SeekBase::Current, delta),
                    SeekFrom::End(delta) => {
                        let state = core.blk_table.update(self, false, false, None)?;
                        (SeekBase::End(state.file_size), delta)
                    }
                };
                core.tx
                    .offset
                    .seek(base.0, base.1)
                    .ok_or_else(|| eyre::eyre!("seek to a negative offset"))
            }
            None => {
                use std::io::Seek;
                (&self.host)
                    .seek(pos)
                    .map_err(FsError::Io)
                    .wrap_err("host lseek failed")
            }
        }
    }

    /// Commits are already durable when they become visible, so fsync only
    /// refreshes the persistent size hint (plus an msync for mounts whose
    /// pages are not the media).
    pub fn fsync(&self) -> Result<()> {
        match &self.core {
            Some(core) => {
                let state = core.blk_table.update(self, false, false, None)?;
                core.mtable.flush_base()?;
                let meta = self.meta();
                meta.lock()?;
                meta.set_file_size_hint(state.file_size);
                meta.unlock();
                Ok(())
            }
            None => self
                .host
                .sync_all()
                .map_err(FsError::Io)
                .wrap_err("host fsync failed"),
        }
    }

    /// The logical file size implied by the committed log prefix.
    pub fn file_size(&self) -> Result<u64> {
        match &self.core {
            Some(core) => Ok(core.blk_table.update(self, false, false, None)?.file_size),
            None => Ok(self.host.metadata().map_err(FsError::Io)?.len()),
        }
    }

    fn check_writable(&self, core: &Core) -> Result<()> {
        ensure!(
            !core.read_only.load(Ordering::Acquire),
            FsError::Corruption("file is read-only after detected corruption".into())
        );
        Ok(())
    }

    fn latch_corruption(&self, core: &Core, result: Result<usize>) -> Result<usize> {
        if let Err(report) = &result {
            if matches!(report.downcast_ref::<FsError>(), Some(FsError::Corruption(_))) {
                core.read_only.store(true, Ordering::Release);
            }
        }
        result
    }

    fn core(&self) -> &Core {
        self.core.as_ref().expect("core accessor on passthrough file")
    }

    pub(crate) fn meta(&self) -> &MetaBlock {
        self.core().mtable.meta()
    }

    pub(crate) fn mtable(&self) -> &MemTable {
        &self.core().mtable
    }

    pub(crate) fn bitmaps(&self) -> &BitmapSet {
        &self.core().bitmaps
    }

    pub(crate) fn blk_table(&self) -> &BlkTable {
        &self.core().blk_table
    }

    pub(crate) fn tx(&self) -> &TxMgr {
        &self.core().tx
    }

    /// Marks a block live in the persistent bitmap and the shared cache.
    pub(crate) fn set_allocated(&self, lidx: LogicalBlockIdx) {
        let core = self.core();
        core.bitmaps.set_allocated(lidx);
        core.shm.cache_set_allocated(lidx);
    }

    /// Runs `f` with the calling thread's allocator for this file.
    pub(crate) fn with_allocator<R>(&self, f: impl FnOnce(&mut Allocator) -> Result<R>) -> Result<R> {
        let core = self.core();
        let slot = self.thread_slot()?;
        let mut allocator = core.allocators[slot].lock();
        f(&mut allocator)
    }

    /// Pins the tx block the calling thread may still read, if the thread
    /// has registered a slot. Threads that only ever read skip pinning.
    pub(crate) fn try_pin_tx_block(&self, lidx: LogicalBlockIdx) {
        if let Some(slot) = self.cached_slot() {
            self.core().shm.per_thread(slot).pin_tx_block(lidx);
        }
    }

    /// The calling thread's per-thread slot, registering one on first use.
    fn thread_slot(&self) -> Result<usize> {
        if let Some(slot) = self.cached_slot() {
            return Ok(slot);
        }
        let core = self.core();
        let slot = core.shm.alloc_per_thread_data(self.meta())?;
        trace!(slot, "registered per-thread slot");
        THREAD_SLOTS.with(|slots| {
            slots.borrow_mut().insert(self.ident, slot);
        });
        Ok(slot)
    }

    fn cached_slot(&self) -> Option<usize> {
        THREAD_SLOTS.with(|slots| slots.borrow().get(&self.ident).copied())
    }

    #[cfg(test)]
    pub(crate) fn shm_path(&self) -> std::path::PathBuf {
        self.core().shm.path().clone()
    }

    #[cfg(test)]
    pub(crate) fn block_is_allocated(&self, lidx: LogicalBlockIdx) -> bool {
        self.core().bitmaps.is_allocated(lidx)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.core.is_some() {
            // best effort: leave an up-to-date size hint behind
            let _ = self.fsync();
        }
    }
}

thread_local! {
    /// Per-thread slot indexes, keyed by file identity.
    static THREAD_SLOTS: std::cell::RefCell<hashbrown::HashMap<(u64, u64, u64), usize>> =
        std::cell::RefCell::new(hashbrown::HashMap::new());
}
