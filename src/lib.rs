//! Crash-consistent file storage on byte-addressable persistent memory.
//!
//! `lapis` keeps a file's data in a memory-mapped PMEM file and makes
//! writes durable with cache-line flushes and store fences instead of
//! syscalls. Every write goes to freshly allocated shadow blocks and
//! becomes visible by CAS-ing an 8-byte commit entry into a shared
//! transaction log; after a power failure the file state is exactly the
//! prefix of transactions whose commit entries reached the log. Readers
//! translate application offsets through a wait-free DRAM table that is
//! rebuilt from the log on open and folded forward on demand.
//!
//! Concurrency model, in one breath: the allocation bitmap and the tx log
//! tail are lock-free (CAS from zero, exactly once per slot); per-thread
//! state (allocator cache, log block) is owned by a [`FileHandle`]; the
//! single per-file futex-backed lock covers only file growth, block-table
//! folding, and ticket issue for relative operations.
//!
//! ```no_run
//! use lapis::Config;
//!
//! let file = Config {
//!     path: "/mnt/pmem/data.lapis".into(),
//!     ..Default::default()
//! }
//! .open()
//! .unwrap();
//!
//! let mut handle = file.handle();
//! handle.pwrite(b"hello", 0).unwrap();
//! let mut buf = [0u8; 5];
//! file.pread(&mut buf, 0).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

mod alloc;
mod btable;
mod config;
mod debug_delay;
mod entry;
mod error;
mod file;
mod futex;
mod idx;
mod layout;
mod log_mgr;
mod mtable;
mod offset;
mod pmem;
mod readpath;
pub mod registry;
mod shm;
mod tx;
mod writepath;

pub use config::Config;
pub use error::{Error, Result};
pub use file::File;
pub use idx::{LogEntryIdx, LogicalBlockIdx, TxCursor, VirtualBlockIdx};
pub use layout::{BLOCK_SHIFT, BLOCK_SIZE, CAPACITY_BLOCKS};
pub use pmem::{fence, persist_range};
pub use readpath::Whence;

use alloc::Allocator;
use log_mgr::LogMgr;
use shm::ShmSlot;

use std::sync::Arc;

/// A per-thread handle onto an open [`File`]. Owns the thread's allocator
/// cache and log block, which is what lets writes run without any per-file
/// lock on the data path. Cheap to create; make one per thread.
pub struct FileHandle {
    // shm_slot first: its Drop writes into the shared-memory mapping, so
    // it must run while the Arcs below still keep the file alive
    pub(crate) shm_slot: Option<ShmSlot>,
    pub(crate) file: Arc<File>,
    pub(crate) alloc: Allocator,
    pub(crate) log_mgr: LogMgr,
}

impl FileHandle {
    /// Reads at an explicit offset; see [`File::pread`].
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file.pread(buf, offset)
    }
}
