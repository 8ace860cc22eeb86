//! Per-thread log manager. Log entries are 16-byte records living in log
//! blocks that belong to exactly one thread, so appends need no CAS; the
//! commit entry's fence makes them visible to other threads.

use std::sync::Arc;

use crate::alloc::Allocator;
use crate::entry::LogEntry;
use crate::error::Result;
use crate::file::File;
use crate::idx::LogEntryIdx;
use crate::layout::{LOG_ENTRY_SIZE, NUM_LOG_ENTRIES};

pub(crate) struct LogMgr {
    file: Arc<File>,
    /// Current log block and the next free slot in it, if one is open.
    head: Option<(LogEntryIdx, usize)>,
}

impl LogMgr {
    pub fn new(file: Arc<File>) -> LogMgr {
        LogMgr { file, head: None }
    }

    /// Reserves the next slot in this thread's log block (allocating a
    /// fresh block when the current one is full), writes `entry`, and
    /// persists it. The returned index is what a commit entry references.
    pub fn append(&mut self, alloc: &mut Allocator, entry: LogEntry) -> Result<LogEntryIdx> {
        let (block, local) = match self.head {
            Some((idx, next)) if next < NUM_LOG_ENTRIES => (idx.block, next),
            _ => {
                let block = alloc.alloc(1)?;
                log::trace!("opened log block {}", block);
                (block, 0)
            }
        };

        let idx = LogEntryIdx {
            block,
            local: local as u8,
        };
        let ptr = self.file.log_entry_ptr(idx)?;
        let encoded = entry.encode();
        unsafe {
            std::ptr::copy_nonoverlapping(encoded.as_ptr(), ptr, LOG_ENTRY_SIZE);
        }
        crate::pmem::persist_range(ptr, LOG_ENTRY_SIZE);

        self.head = Some((idx, local + 1));
        Ok(idx)
    }
}
