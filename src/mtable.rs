//! # Memory Table
//!
//! Maps logical block indexes to addresses. The whole initial file is mapped
//! up front; when the file grows past that, the unit containing the accessed
//! block is mapped on demand at its file offset and kept until close. A
//! mapping, once created, is never moved or unmapped while the file is open,
//! so every address handed out stays valid for the lifetime of the file;
//! that stability is what lets the lock-free paths hold pointers across
//! growth without epochs or guards.
//!
//! Growth itself is a three-level fast path: a process-local copy of the
//! block count, a re-read of the authoritative count in the meta block, and
//! only then the meta lock plus `ftruncate`. Growing is idempotent under the
//! lock, so two processes racing growth both succeed.

use std::fs::File;
use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::RwLock;

use crate::config::{Config, BLOCK_SHIFT, BLOCK_SIZE};
use crate::error::FsError;
use crate::layout::{LogicalBlockIdx, MetaBlock};

/// 2 MiB huge page shift passed to `MmapOptions::huge`.
const HUGE_2MB_SHIFT: u8 = 21;

#[derive(Debug)]
pub struct MemTable {
    file: File,
    cfg: Config,
    /// Mapping of the initial file contents, blocks `0..base_blocks`.
    base: MmapRaw,
    base_blocks: u32,
    /// Lazily mapped grow units past the base mapping, keyed by the unit's
    /// first block.
    units: RwLock<HashMap<LogicalBlockIdx, MmapRaw>>,
    /// Process-local copy of `meta.num_blocks`; may lag, never leads.
    num_blocks_local: AtomicU32,
}

impl MemTable {
    /// Maps `file` and installs block 0 as the meta block. Returns the table
    /// and whether the file was empty (and therefore needs its meta block
    /// stamped).
    ///
    /// The file size must be block-aligned; empty or non-grow-unit-aligned
    /// files are extended first.
    pub fn init(file: File, cfg: Config) -> Result<(Self, bool)> {
        let len = file
            .metadata()
            .map_err(FsError::Io)
            .wrap_err("failed to stat backing file")?
            .len();
        ensure!(
            len % BLOCK_SIZE as u64 == 0,
            FsError::NotCoreFile
        );
        let created = len == 0;

        // only a fresh file is resized here: an existing file might turn out
        // to be foreign (bad signature), and passthrough must not alter it
        let mapped_len = if created {
            let target = (cfg.prealloc_blocks as u64) << BLOCK_SHIFT;
            file.set_len(target)
                .map_err(FsError::Io)
                .wrap_err_with(|| format!("failed to preallocate {target} bytes"))?;
            target
        } else {
            len
        };

        let base = Self::map(&file, &cfg, 0, mapped_len as usize)?;
        let num_blocks = (mapped_len >> BLOCK_SHIFT) as u32;

        let table = Self {
            file,
            cfg,
            base,
            base_blocks: num_blocks,
            units: RwLock::new(HashMap::new()),
            num_blocks_local: AtomicU32::new(num_blocks),
        };
        table.meta().set_num_blocks(num_blocks);
        Ok((table, created))
    }

    pub fn meta(&self) -> &MetaBlock {
        // SAFETY: the base mapping is block 0 onward, page aligned, and
        // lives as long as `self`.
        unsafe { MetaBlock::from_ptr(self.base.as_mut_ptr() as *const u8) }
    }

    /// Ensures the backing file has real blocks behind `lidx`, growing it if
    /// necessary.
    pub fn validate(&self, lidx: LogicalBlockIdx) -> Result<()> {
        // fast path: the local copy already covers it
        if lidx < self.num_blocks_local.load(Ordering::Acquire) {
            return Ok(());
        }

        // medium path: another thread or process may have grown the file
        let meta = self.meta();
        let global = meta.num_blocks();
        self.num_blocks_local.store(global, Ordering::Release);
        if lidx < global {
            return Ok(());
        }

        // slow path: revalidate under the meta lock and grow
        meta.lock()?;
        let result = self.grow_locked(lidx);
        meta.unlock();
        result
    }

    fn grow_locked(&self, lidx: LogicalBlockIdx) -> Result<()> {
        let meta = self.meta();
        if lidx < meta.num_blocks() {
            self.num_blocks_local
                .store(meta.num_blocks(), Ordering::Release);
            return Ok(());
        }
        let new_blocks = self.cfg.grow_target_blocks(lidx);
        self.file
            .set_len((new_blocks as u64) << BLOCK_SHIFT)
            .map_err(FsError::Io)
            .wrap_err_with(|| format!("failed to grow backing file to {new_blocks} blocks"))?;
        meta.set_num_blocks(new_blocks);
        self.num_blocks_local.store(new_blocks, Ordering::Release);
        Ok(())
    }

    /// Address of block `lidx`. Stable until the file is closed.
    pub fn get_addr(&self, lidx: LogicalBlockIdx) -> Result<*mut u8> {
        if lidx < self.base_blocks {
            // SAFETY: in-bounds offset into the base mapping.
            return Ok(unsafe { self.base.as_mut_ptr().add((lidx as usize) << BLOCK_SHIFT) });
        }

        let unit = self.cfg.grow_unit_base(lidx);
        let in_unit = ((lidx - unit) as usize) << BLOCK_SHIFT;
        if let Some(map) = self.units.read().get(&unit) {
            // SAFETY: in-bounds offset into the unit mapping.
            return Ok(unsafe { map.as_mut_ptr().add(in_unit) });
        }

        self.validate(lidx)?;

        let mut units = self.units.write();
        if !units.contains_key(&unit) {
            let map = Self::map(
                &self.file,
                &self.cfg,
                (unit as u64) << BLOCK_SHIFT,
                self.cfg.grow_unit_bytes() as usize,
            )?;
            units.insert(unit, map);
        }
        let map = &units[&unit];
        // SAFETY: in-bounds offset into the unit mapping just looked up.
        Ok(unsafe { map.as_mut_ptr().add(in_unit) })
    }

    /// Read-only view of block `lidx`.
    ///
    /// # Safety
    ///
    /// The caller must ensure no thread writes the block for the borrow's
    /// duration; the commit protocol provides this for committed blocks.
    pub unsafe fn block_slice<'a>(&'a self, lidx: LogicalBlockIdx) -> Result<&'a [u8]> {
        let ptr = self.get_addr(lidx)?;
        // SAFETY: one whole mapped block; aliasing per caller contract.
        Ok(unsafe { std::slice::from_raw_parts(ptr, BLOCK_SIZE) })
    }

    fn map(file: &File, cfg: &Config, offset: u64, len: usize) -> Result<MmapRaw> {
        let mut opts = MmapOptions::new();
        opts.offset(offset).len(len);
        if cfg.use_hugepage {
            opts.huge(Some(HUGE_2MB_SHIFT));
        }
        // map_raw is MAP_SHARED read+write: stores go straight to the file
        // pages, which on PMEM-backed mounts is the media itself
        opts.map_raw(file)
            .map_err(FsError::Io)
            .wrap_err_with(|| format!("failed to mmap {len} bytes at offset {offset}"))
    }

    /// Flushes the whole base mapping; used by fsync on non-PMEM mounts.
    pub fn flush_base(&self) -> Result<()> {
        self.base
            .flush()
            .map_err(FsError::Io)
            .wrap_err("failed to flush base mapping")
    }
}

// SAFETY: the mappings and file handle are freely shareable; interior
// mutability is confined to the RwLock'd unit table and atomics.
unsafe impl Send for MemTable {}
unsafe impl Sync for MemTable {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUM_BITMAP_BLOCKS;

    fn open_temp() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("core.bin"))
            .unwrap();
        (dir, file)
    }

    #[test]
    fn init_preallocates_fresh_file() {
        let (_dir, file) = open_temp();
        let cfg = Config::default();

        let (table, created) = MemTable::init(file, cfg.clone()).unwrap();

        assert!(created);
        assert_eq!(table.meta().num_blocks(), cfg.prealloc_blocks);
    }

    #[test]
    fn reopen_is_not_created() {
        let (_dir, file) = open_temp();
        let clone = file.try_clone().unwrap();
        let (table, created) = MemTable::init(file, Config::default()).unwrap();
        assert!(created);
        table.meta().init(table.meta().num_blocks(), NUM_BITMAP_BLOCKS).unwrap();
        drop(table);

        let (table, created) = MemTable::init(clone, Config::default()).unwrap();
        assert!(!created);
        assert!(table.meta().verify_signature());
    }

    #[test]
    fn validate_grows_in_units() {
        let (_dir, file) = open_temp();
        let cfg = Config::default();
        let host = file.try_clone().unwrap();
        let (table, _) = MemTable::init(file, cfg.clone()).unwrap();
        table
            .meta()
            .init(table.meta().num_blocks(), NUM_BITMAP_BLOCKS)
            .unwrap();

        let beyond = cfg.prealloc_blocks + 3;
        table.validate(beyond).unwrap();

        assert_eq!(table.meta().num_blocks(), cfg.grow_target_blocks(beyond));
        assert_eq!(
            host.metadata().unwrap().len(),
            (cfg.grow_target_blocks(beyond) as u64) << BLOCK_SHIFT
        );
    }

    #[test]
    fn validate_is_idempotent() {
        let (_dir, file) = open_temp();
        let cfg = Config::default();
        let (table, _) = MemTable::init(file, cfg.clone()).unwrap();
        table
            .meta()
            .init(table.meta().num_blocks(), NUM_BITMAP_BLOCKS)
            .unwrap();

        table.validate(cfg.prealloc_blocks).unwrap();
        let after_first = table.meta().num_blocks();
        table.validate(cfg.prealloc_blocks).unwrap();

        assert_eq!(table.meta().num_blocks(), after_first);
    }

    #[test]
    fn addresses_are_stable_across_growth() {
        let (_dir, file) = open_temp();
        let cfg = Config::default();
        let (table, _) = MemTable::init(file, cfg.clone()).unwrap();
        table
            .meta()
            .init(table.meta().num_blocks(), NUM_BITMAP_BLOCKS)
            .unwrap();

        let addr5 = table.get_addr(5).unwrap();
        let grown = table.get_addr(cfg.prealloc_blocks + 1).unwrap();
        assert!(!grown.is_null());

        assert_eq!(table.get_addr(5).unwrap(), addr5);
        assert_eq!(
            table.get_addr(cfg.prealloc_blocks + 1).unwrap(),
            grown
        );
    }

    #[test]
    fn writes_through_addr_persist_in_file() {
        use std::os::unix::fs::FileExt;

        let (_dir, file) = open_temp();
        let host = file.try_clone().unwrap();
        let (table, _) = MemTable::init(file, Config::default()).unwrap();
        table
            .meta()
            .init(table.meta().num_blocks(), NUM_BITMAP_BLOCKS)
            .unwrap();

        let addr = table.get_addr(7).unwrap();
        // SAFETY: block 7 is mapped and nothing else touches it.
        unsafe { std::ptr::write_bytes(addr, 0xAB, BLOCK_SIZE) };
        table.flush_base().unwrap();

        let mut buf = [0u8; 16];
        host.read_exact_at(&mut buf, 7u64 << BLOCK_SHIFT).unwrap();
        assert_eq!(buf, [0xAB; 16]);
    }

    #[test]
    fn rejects_unaligned_file() {
        let (_dir, file) = open_temp();
        file.set_len(100).unwrap();

        let err = MemTable::init(file, Config::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FsError>(),
            Some(FsError::NotCoreFile)
        ));
    }
}
