//! Per-inode shared memory under `/dev/shm`, used for cross-process
//! bookkeeping that must not live in the file itself: a mirror region for
//! the allocation bitmap (maintained by the external garbage collector for
//! fast lookups) and one slot per thread where a writer pins the tx block
//! it is working on, guarded by a robust pthread mutex so the collector can
//! tell dead owners from live ones.
//!
//! The shm path is derived from the file's inode and ctime and cached in an
//! xattr on the file; filesystems without xattr support just recompute it.

use std::fs::File as StdFile;
use std::io;
use std::mem::size_of;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use fault_injection::maybe;
use memmap2::{MmapOptions, MmapRaw};

use crate::idx::LogicalBlockIdx;
use crate::layout::TOTAL_BITMAP_WORDS;

pub(crate) const MAX_NUM_THREADS: usize = 128;
pub(crate) const SHM_PER_THREAD_SIZE: usize = 128;

const BITMAP_MIRROR_BYTES: usize = TOTAL_BITMAP_WORDS * size_of::<u64>();
const SHM_SIZE: usize =
    (BITMAP_MIRROR_BYTES + MAX_NUM_THREADS * SHM_PER_THREAD_SIZE + 4095) & !4095;

const XATTR_NAME: &[u8] = b"user.lapis.shm_path\0";

/// One cache-line-pair slot in shared memory. A thread claims a slot for
/// the lifetime of its file handle and parks the index of the tx block it
/// may be appending to, which fences the garbage collector off that block
/// and everything after it.
#[repr(C)]
pub(crate) struct PerThreadData {
    initialized: AtomicU32,
    index: AtomicU32,
    tx_block_idx: AtomicU32,
    _pad: u32,
    mutex: libc::pthread_mutex_t,
    _tail: [u8; SHM_PER_THREAD_SIZE - 16 - size_of::<libc::pthread_mutex_t>()],
}

const _: () = assert!(size_of::<PerThreadData>() == SHM_PER_THREAD_SIZE);

impl PerThreadData {
    fn try_claim(&self, index: usize) -> bool {
        if self
            .initialized
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.index.store(index as u32, Ordering::Relaxed);
        self.tx_block_idx.store(0, Ordering::Relaxed);
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            libc::pthread_mutexattr_init(&mut attr);
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            libc::pthread_mutex_init(&self.mutex as *const _ as *mut _, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
        }
        log::debug!("claimed shm slot {}", index);
        true
    }

    pub fn set_tx_block(&self, block: LogicalBlockIdx) {
        self.tx_block_idx.store(block.0, Ordering::Release);
    }

    pub fn release(&self) {
        unsafe {
            libc::pthread_mutex_destroy(&self.mutex as *const _ as *mut _);
        }
        self.tx_block_idx.store(0, Ordering::Relaxed);
        self.initialized.store(0, Ordering::Release);
    }
}

/// A claimed slot; releases on drop.
pub(crate) struct ShmSlot {
    slot: *const PerThreadData,
}

unsafe impl Send for ShmSlot {}

impl ShmSlot {
    pub fn set_tx_block(&self, block: LogicalBlockIdx) {
        unsafe { &*self.slot }.set_tx_block(block);
    }
}

impl Drop for ShmSlot {
    fn drop(&mut self) {
        unsafe { &*self.slot }.release();
    }
}

pub(crate) struct ShmMgr {
    map: MmapRaw,
    path: PathBuf,
    created: bool,
}

impl ShmMgr {
    /// Opens (creating if absent) the shared memory object for `file`.
    pub fn open(file: &StdFile) -> io::Result<ShmMgr> {
        let path = Self::resolve_path(file)?;

        let mut created = true;
        let shm_file = match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => {
                maybe!(f.set_len(SHM_SIZE as u64))?;
                f
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                created = false;
                maybe!(std::fs::OpenOptions::new().read(true).write(true).open(&path))?
            }
            Err(e) => return Err(e),
        };

        let map = maybe!(MmapOptions::new().len(SHM_SIZE).map_raw(&shm_file))?;
        log::debug!("shared memory at {:?} (created: {})", path, created);
        Ok(ShmMgr { map, path, created })
    }

    /// Whether this process brought the shared memory object into
    /// existence. `/dev/shm` is tmpfs, so a missing object means the
    /// machine rebooted (or the collector tore it down) since the file was
    /// last touched, which is exactly when the unflushed allocation bitmap
    /// in the file can no longer be trusted and must be rebuilt from the
    /// tx stream.
    pub fn created(&self) -> bool {
        self.created
    }

    /// `/dev/shm/lapis_<ino>_<ctime>`, cached as an xattr on the file so
    /// the name survives ctime changes.
    fn resolve_path(file: &StdFile) -> io::Result<PathBuf> {
        let fd = file.as_raw_fd();
        let mut buf = [0u8; 256];
        let len = unsafe {
            libc::fgetxattr(
                fd,
                XATTR_NAME.as_ptr() as *const libc::c_char,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if len > 0 {
            let cached = String::from_utf8_lossy(&buf[..len as usize]).into_owned();
            return Ok(cached.into());
        }

        let meta = maybe!(file.metadata())?;
        let stamp = (meta.ctime() * 1_000_000_000 + meta.ctime_nsec()) >> 3;
        let path = format!("/dev/shm/lapis_{:016x}_{:013x}", meta.ino(), stamp);

        let rc = unsafe {
            libc::fsetxattr(
                fd,
                XATTR_NAME.as_ptr() as *const libc::c_char,
                path.as_ptr() as *const libc::c_void,
                path.len(),
                0,
            )
        };
        if rc != 0 {
            // tmpfs and friends reject user xattrs; the computed name is
            // deterministic enough to carry on with
            log::trace!("could not cache shm path on {:?}", file);
        }
        Ok(path.into())
    }

    fn slot(&self, index: usize) -> &PerThreadData {
        assert!(index < MAX_NUM_THREADS);
        unsafe {
            let base = self.map.as_mut_ptr().add(BITMAP_MIRROR_BYTES);
            &*(base as *const PerThreadData).add(index)
        }
    }

    /// Claims the first free per-thread slot, if any remain.
    pub fn alloc_per_thread_slot(&self) -> Option<ShmSlot> {
        for index in 0..MAX_NUM_THREADS {
            let slot = self.slot(index);
            if slot.try_claim(index) {
                return Some(ShmSlot {
                    slot: slot as *const PerThreadData,
                });
            }
        }
        log::warn!("all {} shm slots claimed", MAX_NUM_THREADS);
        None
    }

    /// Removes the shared memory object. The shim calls this when the
    /// backing file itself is unlinked.
    pub fn unlink(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("could not unlink {:?}: {}", self.path, e);
        }
    }
}
