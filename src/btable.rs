//! The volatile block table: a DRAM reconstruction of the virtual ->
//! logical mapping, rebuilt by replaying committed tx entries. One writer
//! at a time (the meta lock holder) folds new commits in; readers translate
//! through wait-free atomic loads and never block.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use pagetable::PageTable;

use crate::entry::TxEntry;
use crate::error::{Error, Result};
use crate::file::File;
use crate::idx::{LogicalBlockIdx, TxCursor, VirtualBlockIdx};
use crate::layout::BLOCK_SHIFT;

pub(crate) struct BlkTable {
    /// virtual block idx -> logical block idx; 0 is a hole. The page table
    /// grows itself, which stands in for amortized-doubling a dense vec.
    table: PageTable<AtomicU64>,
    /// Packed cursor of the next tx entry to apply.
    tail: AtomicU64,
    file_size: AtomicU64,
}

impl BlkTable {
    pub fn new() -> BlkTable {
        BlkTable {
            table: PageTable::<AtomicU64>::default(),
            tail: AtomicU64::new(0),
            file_size: AtomicU64::new(0),
        }
    }

    /// Translate; zero means the block was never written (a hole).
    pub fn get(&self, virtual_idx: VirtualBlockIdx) -> LogicalBlockIdx {
        LogicalBlockIdx(self.table.get(u64::from(virtual_idx.0)).load(Ordering::Acquire) as u32)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// Folds every committed tx entry at or after the published tail into
    /// the table. The caller must hold the meta lock; readers may run
    /// concurrently. Returns the new tail and file size.
    ///
    /// With `init_bitmap` set (first open only) the shared bitmap is wiped
    /// and re-seeded from the replay, which is the whole recovery story:
    /// an allocation that never reached a commit entry simply never gets
    /// its bit back.
    pub fn update(&self, file: &File, init_bitmap: bool) -> Result<(TxCursor, u64)> {
        let mut cursor = TxCursor::from_word(self.tail.load(Ordering::Relaxed));
        let mut file_size = self.file_size.load(Ordering::Relaxed);

        if init_bitmap {
            file.bitmap_reset();
            file_size = file_size.max(file.meta().file_size.load(Ordering::Acquire));
        }

        loop {
            if !file.handle_idx_overflow(&mut cursor, None)? {
                break;
            }
            if init_bitmap && cursor.block.0 != 0 && cursor.local == 0 {
                file.bitmap_set(cursor.block);
            }
            let word = file.tx_slot(cursor)?.load(Ordering::Acquire);
            let entry = match TxEntry::decode(word) {
                Ok(None) => break,
                Ok(Some(entry)) => entry,
                Err(Error::Corrupt { word }) => {
                    // treat the slot as the end of history
                    log::warn!(
                        "corrupt tx entry {:#018x} at {}; truncating visible history",
                        word,
                        cursor
                    );
                    break;
                }
                Err(e) => return Err(e),
            };

            match entry {
                TxEntry::Begin { .. } => {}
                TxEntry::CommitInline {
                    virtual_idx,
                    num_blocks,
                    logical_idx,
                } => {
                    self.apply(file, virtual_idx, logical_idx, num_blocks, init_bitmap);
                    file_size = file_size
                        .max(u64::from(virtual_idx.0 + num_blocks) << BLOCK_SHIFT);
                }
                TxEntry::CommitIndirect { log_entry, .. } => {
                    let log = match file.read_log_entry(log_entry) {
                        Ok(log) => log,
                        Err(Error::Corrupt { word }) => {
                            log::warn!(
                                "commit at {} references corrupt log entry {:#018x}; \
                                 truncating visible history",
                                cursor,
                                word
                            );
                            break;
                        }
                        Err(e) => return Err(e),
                    };
                    if init_bitmap {
                        file.bitmap_set(log_entry.block);
                    }
                    self.apply(
                        file,
                        log.virtual_idx,
                        log.logical_idx,
                        log.num_blocks(),
                        init_bitmap,
                    );
                    file_size =
                        file_size.max((u64::from(log.virtual_idx.0) << BLOCK_SHIFT) + u64::from(log.size));
                }
            }
            cursor = cursor.successor();
        }

        // make the size durable before publishing it to readers
        let meta = file.meta();
        if meta.file_size.load(Ordering::Acquire) < file_size {
            meta.file_size.store(file_size, Ordering::Release);
            crate::pmem::persist_range(meta as *const _ as *const u8, 8);
        }

        // the fence splits the table stores above from the publication
        // below; need_update's double-load brackets the matching reads
        fence(Ordering::AcqRel);
        self.file_size.store(file_size, Ordering::Release);
        self.tail.store(cursor.to_word(), Ordering::Release);
        Ok((cursor, file_size))
    }

    fn apply(
        &self,
        file: &File,
        virtual_idx: VirtualBlockIdx,
        logical_idx: LogicalBlockIdx,
        num_blocks: u32,
        init_bitmap: bool,
    ) {
        for i in 0..num_blocks {
            self.table
                .get(u64::from(virtual_idx.0 + i))
                .store(u64::from(logical_idx.0 + i), Ordering::Release);
            if init_bitmap {
                file.bitmap_set(LogicalBlockIdx(logical_idx.0 + i));
            }
        }
    }

    /// Thread-safe fast-path check. Returns false with the published
    /// `(tail, file_size)` in `out` when the table already reflects the
    /// whole tx stream, so the caller can proceed without the meta lock.
    /// Returns true when an update pass is (or may be) necessary.
    pub fn need_update(
        &self,
        file: &File,
        alloc: Option<&mut crate::alloc::Allocator>,
        out: &mut (TxCursor, u64),
    ) -> Result<bool> {
        let tail_a = self.tail.load(Ordering::Relaxed);
        let size_a = self.file_size.load(Ordering::Relaxed);
        fence(Ordering::AcqRel);
        let tail_b = self.tail.load(Ordering::Relaxed);
        let size_b = self.file_size.load(Ordering::Relaxed);
        if tail_a != tail_b || size_a != size_b {
            // a writer is mid-publication
            return Ok(true);
        }

        let mut cursor = TxCursor::from_word(tail_a);
        if file.handle_idx_overflow(&mut cursor, alloc)?
            && file.tx_slot(cursor)?.load(Ordering::Acquire) != 0
        {
            return Ok(true);
        }
        *out = (cursor, size_a);
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn recovery_marks_every_reachable_block_in_the_bitmap() {
        let _ = env_logger::try_init();
        let dir = std::path::Path::new("testing_data_directories").join("btable_recovery");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let config = Config {
            path: dir.join("data.lapis"),
            ..Default::default()
        };

        {
            let file = config.open().unwrap();
            let mut handle = file.handle();
            handle.pwrite(b"payload crossing nothing", 0).unwrap();
            handle.pwrite(&[7u8; 5000], 70_000).unwrap();
            // drop the shm object so the reopen is treated as first-open
            file.unlink_shm();
        }

        let file = config.open().unwrap();
        for virtual_idx in [0u32, 17, 18] {
            let logical = file.btable.get(VirtualBlockIdx(virtual_idx));
            assert_ne!(logical.0, 0, "virtual block {} not mapped", virtual_idx);
            let word = file.bitmap_word(logical.0 as usize / 64);
            assert_ne!(
                word.load(Ordering::Acquire) & (1 << (logical.0 % 64)),
                0,
                "bitmap bit missing for logical block {}",
                logical
            );
        }
        file.unlink_shm();
    }
}
