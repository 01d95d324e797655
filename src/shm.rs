//! # Shared-Memory Manager
//!
//! Every core file has one shared-memory object,
//! `/dev/shm/ulayfs_<ino:016x>_<ctime-hash:013x>`, found through an extended
//! attribute on the backing file so any process that opens the file finds
//! the same region. Its fixed layout:
//!
//! ```text
//! [ bitmap cache: TOTAL_NUM_BITMAP_BYTES ][ PerThreadData x MAX_NUM_THREADS ]
//! ```
//!
//! The per-thread records coordinate liveness: a thread claims a slot with a
//! CAS state machine and then holds the slot's robust mutex for as long as
//! it lives. Probing the mutex tells any other thread whether the owner is
//! still alive: `EBUSY` means alive, acquiring it (or `EOWNERDEAD`) means
//! the owner died and the slot can be reclaimed.
//!
//! Creation uses `O_TMPFILE` + `fchmod` + `fchown` + `fallocate` + `linkat`
//! so the object appears in `/dev/shm` fully sized and with the backing
//! file's ownership in one atomic publish; losing the publish race degrades
//! to opening the winner's object.

use std::fs::File as StdFile;
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, warn};

use crate::config::{
    CACHELINE_SIZE, MAX_NUM_THREADS, SHM_PATH_LEN, SHM_PER_THREAD_SIZE, SHM_SIZE, SHM_XATTR_NAME,
    TOTAL_NUM_BITMAP_BYTES,
};
use crate::error::FsError;
use crate::layout::{LogicalBlockIdx, MetaBlock};
use crate::sync::RobustMutex;

const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_INITIALIZED: u8 = 2;

/// One slot of the per-thread region. The mutex doubles as the liveness
/// beacon: the owning thread locks it at registration and holds it until
/// death.
#[repr(C, align(64))]
pub struct PerThreadData {
    mutex: RobustMutex,
    state: AtomicU8,
    _pad: [u8; 3],
    /// The tx block the owner may still be reading; pinned so reclamation
    /// never pulls a block out from under a live cursor.
    tx_block_idx: AtomicU32,
    index: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<PerThreadData>() == SHM_PER_THREAD_SIZE);

impl PerThreadData {
    /// Claims an uninitialized slot. Caller holds the meta lock, so at most
    /// one thread races dead-slot reclamation at a time.
    fn try_init(&self, index: u32) -> Result<bool> {
        if self
            .state
            .compare_exchange(
                STATE_UNINITIALIZED,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(false);
        }
        self.index.store(index, Ordering::Release);
        self.tx_block_idx.store(0, Ordering::Release);
        self.mutex.init()?;
        // the slot's beacon: held by the owner until it dies
        self.mutex.lock()?;
        self.state.store(STATE_INITIALIZED, Ordering::Release);
        Ok(true)
    }

    /// Whether the slot is claimed by a live thread.
    fn is_live(&self) -> Result<bool> {
        if self.state.load(Ordering::Acquire) != STATE_INITIALIZED {
            return Ok(false);
        }
        match self.mutex.try_lock_raw() {
            0 => {
                // acquiring the beacon means the owner is gone
                self.mutex.unlock();
                Ok(false)
            }
            libc::EBUSY => Ok(true),
            libc::EOWNERDEAD => {
                self.mutex.make_consistent();
                self.mutex.unlock();
                Ok(false)
            }
            rc => bail!("per-thread beacon trylock failed: {rc}"),
        }
    }

    /// Returns a dead slot to the pool.
    fn reset(&self) {
        debug!(index = self.index.load(Ordering::Acquire), "reclaiming dead per-thread slot");
        self.mutex.destroy();
        self.state.store(STATE_UNINITIALIZED, Ordering::Release);
    }

    pub fn pin_tx_block(&self, lidx: LogicalBlockIdx) {
        self.tx_block_idx.store(lidx, Ordering::Release);
    }

    pub fn pinned_tx_block(&self) -> LogicalBlockIdx {
        self.tx_block_idx.load(Ordering::Acquire)
    }
}

pub struct ShmMgr {
    map: MmapRaw,
    /// Keeps the object's fd alive as long as the mapping.
    _file: StdFile,
    path: PathBuf,
    created: bool,
    /// Inode of the shared-memory object: distinguishes region incarnations
    /// when the object is deleted and recreated between opens.
    region_id: u64,
}

impl ShmMgr {
    /// Finds or creates the shared-memory object for the backing file whose
    /// descriptor and stat are given.
    pub fn open(file_fd: RawFd, stat: &libc::stat) -> Result<Self> {
        let path = Self::resolve_path(file_fd, stat)?;
        let path_c = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .expect("shm path has no interior NUL");

        // SAFETY: plain open(2) on an owned path buffer.
        let mut fd = unsafe {
            libc::open(
                path_c.as_ptr(),
                libc::O_RDWR | libc::O_NOFOLLOW | libc::O_CLOEXEC,
                libc::S_IRUSR | libc::S_IWUSR,
            )
        };
        let created = fd < 0;
        if created {
            fd = Self::create(&path_c, stat)?;
        }
        // SAFETY: we own `fd` from here on.
        let file = unsafe { StdFile::from_raw_fd(fd) };
        let region_id = file
            .metadata()
            .map_err(FsError::Io)
            .wrap_err("failed to stat the shared-memory object")
            .map(|md| std::os::unix::fs::MetadataExt::ino(&md))?;

        let map = MmapOptions::new()
            .len(SHM_SIZE)
            .map_raw(&file)
            .map_err(FsError::Io)
            .wrap_err("failed to mmap the shared-memory region")?;

        debug!(path = %path.display(), created, "shared-memory region attached");
        Ok(Self {
            map,
            _file: file,
            path,
            created,
            region_id,
        })
    }

    /// Identity of this region incarnation.
    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    /// Whether this process created the region (and must therefore rebuild
    /// the bitmap from the log).
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Reads the shm path from the backing file's xattr, composing and
    /// storing it on first contact.
    fn resolve_path(file_fd: RawFd, stat: &libc::stat) -> Result<PathBuf> {
        let mut buf = [0u8; SHM_PATH_LEN];
        // SAFETY: fgetxattr writes at most SHM_PATH_LEN bytes into buf.
        let rc = unsafe {
            libc::fgetxattr(
                file_fd,
                SHM_XATTR_NAME.as_ptr() as *const libc::c_char,
                buf.as_mut_ptr() as *mut libc::c_void,
                SHM_PATH_LEN,
            )
        };
        if rc > 0 {
            let len = buf.iter().position(|&b| b == 0).unwrap_or(rc as usize);
            return Ok(PathBuf::from(
                String::from_utf8_lossy(&buf[..len]).into_owned(),
            ));
        }
        let errno = std::io::Error::last_os_error();
        ensure!(
            errno.raw_os_error() == Some(libc::ENODATA),
            FsError::Io(errno)
        );

        // first contact: derive a stable name from identity and birth time
        let ctime_hash =
            ((stat.st_ctime as u64).wrapping_mul(1_000_000_000) + stat.st_ctime_nsec as u64) >> 3;
        let path = format!(
            "/dev/shm/ulayfs_{:016x}_{:013x}",
            stat.st_ino,
            ctime_hash & 0xf_ffff_ffff_ffff
        );
        let mut value = [0u8; SHM_PATH_LEN];
        value[..path.len()].copy_from_slice(path.as_bytes());
        // SAFETY: the value buffer is SHM_PATH_LEN bytes as declared.
        let rc = unsafe {
            libc::fsetxattr(
                file_fd,
                SHM_XATTR_NAME.as_ptr() as *const libc::c_char,
                value.as_ptr() as *const libc::c_void,
                SHM_PATH_LEN,
                0,
            )
        };
        ensure!(rc == 0, FsError::Io(std::io::Error::last_os_error()));
        Ok(PathBuf::from(path))
    }

    /// Creates the object with the backing file's mode and ownership,
    /// publishing it atomically via `linkat`. A lost publish race falls
    /// back to opening the winner's object.
    fn create(path: &std::ffi::CStr, stat: &libc::stat) -> Result<RawFd> {
        // SAFETY: straight libc calls on paths and a freshly opened fd; every
        // failure path closes the fd before returning.
        unsafe {
            let dir = c"/dev/shm";
            let fd = libc::open(
                dir.as_ptr(),
                libc::O_TMPFILE | libc::O_RDWR | libc::O_NOFOLLOW | libc::O_CLOEXEC,
                libc::S_IRUSR | libc::S_IWUSR,
            );
            ensure!(fd >= 0, FsError::Io(std::io::Error::last_os_error()));

            if libc::fchmod(fd, stat.st_mode) < 0
                || libc::fchown(fd, stat.st_uid, stat.st_gid) < 0
                || libc::fallocate(fd, 0, 0, SHM_SIZE as libc::off_t) < 0
            {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                bail!(FsError::Io(err));
            }

            let proc_path = std::ffi::CString::new(format!("/proc/self/fd/{fd}")).unwrap();
            let rc = libc::linkat(
                libc::AT_FDCWD,
                proc_path.as_ptr(),
                libc::AT_FDCWD,
                path.as_ptr(),
                libc::AT_SYMLINK_FOLLOW,
            );
            if rc == 0 {
                return Ok(fd);
            }

            // someone else published first; use their object
            libc::close(fd);
            let fd = libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOFOLLOW | libc::O_CLOEXEC,
                libc::S_IRUSR | libc::S_IWUSR,
            );
            ensure!(fd >= 0, FsError::Io(std::io::Error::last_os_error()));
            Ok(fd)
        }
    }

    /// The per-thread record at `index`.
    pub fn per_thread(&self, index: usize) -> &PerThreadData {
        debug_assert!(index < MAX_NUM_THREADS);
        // SAFETY: the region is SHM_SIZE bytes, the slot array starts at the
        // cache-line-aligned TOTAL_NUM_BITMAP_BYTES offset, and the mapping
        // lives as long as `self`.
        unsafe {
            &*(self
                .map
                .as_mut_ptr()
                .add(TOTAL_NUM_BITMAP_BYTES + index * SHM_PER_THREAD_SIZE)
                as *const PerThreadData)
        }
    }

    /// Claims a per-thread slot for the calling thread, reclaiming slots
    /// whose owners died. Serialized by the meta lock.
    pub fn alloc_per_thread_data(&self, meta: &MetaBlock) -> Result<usize> {
        meta.lock()?;
        let result = self.alloc_slot_locked();
        meta.unlock();
        result
    }

    fn alloc_slot_locked(&self) -> Result<usize> {
        for index in 0..MAX_NUM_THREADS {
            let slot = self.per_thread(index);
            match slot.state.load(Ordering::Acquire) {
                STATE_UNINITIALIZED => {
                    if slot.try_init(index as u32)? {
                        return Ok(index);
                    }
                }
                STATE_INITIALIZED => {
                    if !slot.is_live()? {
                        slot.reset();
                        if slot.try_init(index as u32)? {
                            return Ok(index);
                        }
                    }
                }
                _ => {}
            }
        }
        bail!("all {MAX_NUM_THREADS} per-thread slots are claimed by live threads");
    }

    /// Sets one block's bit in the shared bitmap cache.
    pub fn cache_set_allocated(&self, lidx: LogicalBlockIdx) {
        let word = (lidx / 64) as usize;
        debug_assert!(word * 8 < TOTAL_NUM_BITMAP_BYTES);
        // SAFETY: the cache occupies the first TOTAL_NUM_BITMAP_BYTES of the
        // region and is only touched through atomics.
        let cell = unsafe {
            &*(self.map.as_mut_ptr().add(word * 8) as *const std::sync::atomic::AtomicU64)
        };
        cell.fetch_or(1u64 << (lidx % 64), Ordering::AcqRel);
    }

    /// Clears the whole bitmap cache; used before a rebuild.
    pub fn cache_clear(&self) {
        for word in 0..TOTAL_NUM_BITMAP_BYTES / 8 {
            // SAFETY: see cache_set_allocated.
            let cell = unsafe {
                &*(self.map.as_mut_ptr().add(word * 8) as *const std::sync::atomic::AtomicU64)
            };
            cell.store(0, Ordering::Release);
        }
    }

    /// Removes the shared-memory object for `file_path`, if it has one.
    /// Used by tooling; a live region is simply recreated on next open.
    pub fn unlink_by_file_path(file_path: &std::path::Path) -> Result<()> {
        let path_c = std::ffi::CString::new(file_path.as_os_str().as_encoded_bytes())
            .wrap_err("file path has an interior NUL")?;
        let mut buf = [0u8; SHM_PATH_LEN];
        // SAFETY: getxattr writes at most SHM_PATH_LEN bytes into buf.
        let rc = unsafe {
            libc::getxattr(
                path_c.as_ptr(),
                SHM_XATTR_NAME.as_ptr() as *const libc::c_char,
                buf.as_mut_ptr() as *mut libc::c_void,
                SHM_PATH_LEN,
            )
        };
        if rc <= 0 {
            return Ok(());
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(rc as usize);
        let shm_c = std::ffi::CString::new(&buf[..len]).unwrap();
        // SAFETY: plain unlink(2).
        let rc = unsafe { libc::unlink(shm_c.as_ptr()) };
        if rc < 0 {
            warn!(
                shm = %String::from_utf8_lossy(&buf[..len]),
                "could not unlink shared-memory object"
            );
        }
        Ok(())
    }
}

const _: () = assert!(TOTAL_NUM_BITMAP_BYTES % CACHELINE_SIZE == 0);

// SAFETY: all shared state behind the mapping is atomics and robust mutexes.
unsafe impl Send for ShmMgr {}
unsafe impl Sync for ShmMgr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_thread_record_is_one_cacheline() {
        assert_eq!(std::mem::size_of::<PerThreadData>(), 64);
    }

    #[test]
    fn slot_lifecycle_in_one_thread() {
        let slots: Box<[PerThreadData]> = (0..2)
            // SAFETY: all-zero matches a freshly fallocated region.
            .map(|_| unsafe { std::mem::zeroed::<PerThreadData>() })
            .collect();

        assert!(slots[0].try_init(0).unwrap());
        assert!(!slots[0].try_init(0).unwrap());
        assert!(slots[0].is_live().unwrap());
        assert!(slots[1].try_init(1).unwrap());

        slots[0].pin_tx_block(42);
        assert_eq!(slots[0].pinned_tx_block(), 42);
    }

    #[test]
    fn dead_owner_is_detected() {
        let slot: &'static PerThreadData =
            // SAFETY: all-zero matches a freshly fallocated region.
            Box::leak(Box::new(unsafe { std::mem::zeroed::<PerThreadData>() }));

        std::thread::spawn(move || {
            slot.try_init(0).unwrap();
        })
        .join()
        .unwrap();

        // robust mutex surfaces the dead owner on the first probe
        assert!(!slot.is_live().unwrap());
        slot.reset();
        assert!(slot.try_init(0).unwrap());
    }
}
