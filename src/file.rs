//! `File` is the shared composition of the storage engine: the mapping, the
//! volatile block table, the offset serializer and the shared-memory
//! bookkeeping. Everything mutable per-thread (allocator, log manager)
//! lives in `FileHandle`, handed out by [`File::handle`].

use std::fs::OpenOptions;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock, Weak};

use fault_injection::maybe;

use crate::alloc::Allocator;
use crate::btable::BlkTable;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::idx::{LogicalBlockIdx, TxCursor};
use crate::layout::{MetaBlock, BLOCK_SHIFT, BLOCK_SIZE, GROW_UNIT_BLOCKS, NUM_BITMAP_BLOCKS};
use crate::log_mgr::LogMgr;
use crate::mtable::MemTable;
use crate::offset::OffsetMgr;
use crate::shm::ShmMgr;

pub struct File {
    pub(crate) config: Config,
    mtable: MemTable,
    pub(crate) btable: BlkTable,
    pub(crate) offset_mgr: OffsetMgr,
    pub(crate) shm: Option<ShmMgr>,
    meta: *const MetaBlock,
    fd: RawFd,
    /// Back-reference so `handle` can mint owning handles from `&self`.
    self_ref: OnceLock<Weak<File>>,
}

// All shared mutation goes through atomics in the mapping or the meta lock.
unsafe impl Send for File {}
unsafe impl Sync for File {}

/// Holds the meta lock; unlocks on drop.
pub(crate) struct MetaGuard<'a> {
    file: &'a File,
}

impl Drop for MetaGuard<'_> {
    fn drop(&mut self) {
        crate::futex::unlock(&self.file.meta().meta_lock);
    }
}

impl File {
    pub(crate) fn open_with_config(config: Config) -> Result<Arc<File>> {
        if config.show_config {
            log::info!("opening with {:?}", config);
        }

        let std_file = maybe!(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path))?;
        let fd = std_file.as_raw_fd();
        let len = maybe!(std_file.metadata())?.len();
        if len % (GROW_UNIT_BLOCKS << BLOCK_SHIFT) != 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("file length {} is not growth-unit aligned", len),
            )));
        }

        let shm = match ShmMgr::open(&std_file) {
            Ok(shm) => Some(shm),
            Err(e) => {
                log::warn!("shared-memory bookkeeping unavailable: {}", e);
                None
            }
        };

        let mtable = MemTable::new(std_file)?;
        let fresh = len == 0;
        if fresh {
            mtable.grow_to(GROW_UNIT_BLOCKS)?;
        }

        let meta_ptr = mtable.get(LogicalBlockIdx(0))?;
        let meta = unsafe { meta_ptr.as_meta() } as *const MetaBlock;

        let strict = config.strict_offset_serial;
        let file = Arc::new(File {
            config,
            mtable,
            btable: BlkTable::new(),
            offset_mgr: OffsetMgr::new(strict),
            shm,
            meta,
            fd,
            self_ref: OnceLock::new(),
        });
        let _ = file.self_ref.set(Arc::downgrade(&file));

        if fresh {
            file.format()?;
            log::debug!("formatted fresh file at {:?}", file.config.path);
        } else {
            let expected = file.meta().num_bitmap_blocks.load(Ordering::Acquire);
            if expected != NUM_BITMAP_BLOCKS as u32 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("file formatted with {} bitmap blocks", expected),
                )));
            }
        }

        // the bitmap is only flushed incidentally, so it survives within a
        // boot (cache coherence) but not across one. /dev/shm dying with
        // the boot is the signal: if we created the shm object, rebuild
        // the bitmap from the tx stream
        let init_bitmap = file.shm.as_ref().map_or(true, |shm| shm.created());
        {
            let _guard = file.lock_meta();
            file.btable.update(&file, init_bitmap)?;
        }
        log::debug!(
            "opened {:?}: {} bytes visible",
            file.config.path,
            file.btable.file_size()
        );
        Ok(file)
    }

    /// One-time on-PMEM initialization of a zero-length file. Runs before
    /// the file is shared, so plain stores suffice.
    fn format(&self) -> Result<()> {
        let meta = self.meta();
        meta.num_bitmap_blocks
            .store(NUM_BITMAP_BLOCKS as u32, Ordering::Release);
        for block in 0..=NUM_BITMAP_BLOCKS as u32 {
            self.bitmap_set(LogicalBlockIdx(block));
        }
        crate::pmem::persist_range(meta as *const _ as *const u8, BLOCK_SIZE);
        for block in 1..=NUM_BITMAP_BLOCKS as u32 {
            let ptr = self.mtable.get(LogicalBlockIdx(block))?;
            ptr.persist(0, BLOCK_SIZE);
        }
        Ok(())
    }

    /// A per-thread handle for the write path and relative operations.
    pub fn handle(&self) -> crate::FileHandle {
        let file = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("files are only constructed through Config::open");
        let shm_slot = self.shm.as_ref().and_then(|shm| shm.alloc_per_thread_slot());
        crate::FileHandle {
            alloc: Allocator::new(file.clone()),
            log_mgr: LogMgr::new(file.clone()),
            shm_slot,
            file,
        }
    }

    pub(crate) fn meta(&self) -> &MetaBlock {
        unsafe { &*self.meta }
    }

    pub(crate) fn mtable(&self) -> &MemTable {
        &self.mtable
    }

    pub(crate) fn num_bitmap_blocks(&self) -> u32 {
        self.meta().num_bitmap_blocks.load(Ordering::Acquire)
    }

    pub(crate) fn lock_meta(&self) -> MetaGuard<'_> {
        crate::futex::lock(&self.meta().meta_lock);
        MetaGuard { file: self }
    }

    /// Makes sure the file and the mapping cover at least `num_blocks`
    /// logical blocks. Must not be called with the meta lock held.
    pub(crate) fn ensure_blocks(&self, num_blocks: u64) -> Result<()> {
        if self.mtable.num_mapped_blocks() >= num_blocks {
            return Ok(());
        }
        self.mtable.remap_to(num_blocks)?;
        if self.mtable.num_mapped_blocks() >= num_blocks {
            return Ok(());
        }
        let _guard = self.lock_meta();
        self.mtable.grow_to(num_blocks)
    }

    /// Base address of a data block, remapping on demand.
    pub(crate) fn data_ptr(&self, idx: LogicalBlockIdx) -> Result<*mut u8> {
        let ptr = match self.mtable.get(idx) {
            Ok(ptr) => ptr,
            Err(Error::OutOfRange(_)) => {
                self.mtable.remap_to(u64::from(idx.0) + 1)?;
                self.mtable.get(idx)?
            }
            Err(e) => return Err(e),
        };
        Ok(ptr.data())
    }

    /// Current file size in bytes; what the shim reports for `fstat`.
    pub fn size(&self) -> Result<u64> {
        let mut published = (TxCursor::default(), 0);
        if self.btable.need_update(self, None, &mut published)? {
            let _guard = self.lock_meta();
            let (_, file_size) = self.btable.update(self, false)?;
            Ok(file_size)
        } else {
            Ok(published.1)
        }
    }

    /// The raw descriptor of the underlying file, for the shim's registry.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Removes the per-inode shared memory object. The shim calls this
    /// from its unlink interposition; tests use it to avoid littering
    /// `/dev/shm`.
    pub fn unlink_shm(&self) {
        if let Some(shm) = &self.shm {
            shm.unlink();
        }
    }
}
