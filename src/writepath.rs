//! The write path. A write never touches committed blocks in place:
//!
//! 1. allocate shadow blocks and copy the payload in, merging the old head
//!    and tail images for unaligned edges
//! 2. persist the shadow blocks
//! 3. append a log entry describing the range and persist it
//! 4. CAS a commit entry into the tx tail and persist it
//!
//! A crash anywhere before step 4 leaves the commit slot zero, so recovery
//! replays exactly the writes that were acknowledged.

use crate::entry::{LogEntry, TxEntry, INLINE_IDX_MAX, INLINE_NUM_BLOCKS_MAX, LOG_OP_OVERWRITE};
use crate::error::Result;
use crate::idx::{TxCursor, VirtualBlockIdx};
use crate::layout::{BLOCK_SHIFT, BLOCK_SIZE};
use crate::FileHandle;

impl FileHandle {
    /// Overwrites `[offset, offset + buf.len())` with `buf`. Requests
    /// spanning more than 64 blocks are split into chained transactions at
    /// block boundaries.
    pub fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut done = 0;
        while done < buf.len() {
            let chunk_offset = offset + done as u64;
            let head = (chunk_offset % BLOCK_SIZE as u64) as usize;
            let max_chunk = 64 * BLOCK_SIZE - head;
            let chunk = (buf.len() - done).min(max_chunk);
            self.write_once(&buf[done..done + chunk], chunk_offset)?;
            done += chunk;
        }
        Ok(buf.len())
    }

    /// Writes `buf` at the shared file offset, extending the file, with the
    /// ticketed serializer enforcing program order against other relative
    /// operations.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut count = buf.len() as u64;
        let (offset, ticket, fallback) = {
            let _guard = self.file.lock_meta();
            let (tail, file_size) = self.file.btable.update(&self.file, false)?;
            let (offset, ticket) = self.file.offset_mgr.acquire(&mut count, file_size, false);
            (offset, ticket, tail)
        };

        let result: Result<TxCursor> = (|| {
            let mut point = self.pwrite_serialized(buf, offset)?;
            while !self.file.offset_mgr.validate(&self.file, ticket, point) {
                // committed out of ticket order against an overlapping
                // predecessor; append again so the replay order matches
                // program order
                log::trace!("ticket {} lost its turn; redoing tx append", ticket);
                point = self.pwrite_serialized(buf, offset)?;
            }
            Ok(point)
        })();

        match result {
            Ok(point) => {
                self.file.offset_mgr.release(ticket, point);
                Ok(buf.len())
            }
            Err(e) => {
                // a ticket must always release or its successors spin
                self.file.offset_mgr.release(ticket, fallback);
                Err(e)
            }
        }
    }

    /// Like `pwrite`, but reports the serialization point: the slot right
    /// after the last commit entry placed.
    fn pwrite_serialized(&mut self, buf: &[u8], offset: u64) -> Result<TxCursor> {
        let mut done = 0;
        let mut last_commit = TxCursor::default();
        while done < buf.len() {
            let chunk_offset = offset + done as u64;
            let head = (chunk_offset % BLOCK_SIZE as u64) as usize;
            let max_chunk = 64 * BLOCK_SIZE - head;
            let chunk = (buf.len() - done).min(max_chunk);
            last_commit = self.write_once(&buf[done..done + chunk], chunk_offset)?;
            done += chunk;
        }
        Ok(last_commit.successor())
    }

    /// One transaction: at most 64 blocks. Returns the commit entry's
    /// cursor.
    fn write_once(&mut self, buf: &[u8], offset: u64) -> Result<TxCursor> {
        let virtual_idx = VirtualBlockIdx((offset >> BLOCK_SHIFT) as u32);
        let head = (offset - (u64::from(virtual_idx.0) << BLOCK_SHIFT)) as usize;
        let total = head + buf.len();
        let num_blocks = ((total + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32;
        let residual = num_blocks as usize * BLOCK_SIZE - total;

        // a stale table would hand us outdated pre-images for the edges
        let (tail, _) = self.sync_table()?;

        let logical_idx = self.alloc.alloc(num_blocks)?;

        let begin = TxEntry::Begin {
            virtual_idx,
            num_blocks,
        }
        .encode();
        let begin_cursor = self.file.tx_try_append(tail, begin, &mut self.alloc)?;

        self.fill_shadow(buf, virtual_idx, logical_idx, head, residual, num_blocks)?;

        let aligned = head == 0 && residual == 0;
        let commit = if aligned
            && num_blocks <= INLINE_NUM_BLOCKS_MAX
            && virtual_idx.0 <= INLINE_IDX_MAX
            && logical_idx.0 <= INLINE_IDX_MAX
        {
            TxEntry::CommitInline {
                virtual_idx,
                num_blocks,
                logical_idx,
            }
        } else {
            let log_entry = self.log_mgr.append(
                &mut self.alloc,
                LogEntry {
                    op: LOG_OP_OVERWRITE,
                    last_block_residual: residual as u16,
                    virtual_idx,
                    logical_idx,
                    size: total as u32,
                },
            )?;
            TxEntry::CommitIndirect {
                log_entry,
                begin_hint: begin_cursor.local,
            }
        };

        let commit_cursor =
            self.file
                .tx_try_append(begin_cursor.successor(), commit.encode(), &mut self.alloc)?;

        if let Some(slot) = &self.shm_slot {
            slot.set_tx_block(commit_cursor.block);
        }
        Ok(commit_cursor)
    }

    /// Copies the payload into the freshly allocated shadow blocks, merging
    /// pre-images for an unaligned head and tail, and persists the result.
    fn fill_shadow(
        &self,
        buf: &[u8],
        virtual_idx: VirtualBlockIdx,
        logical_idx: crate::idx::LogicalBlockIdx,
        head: usize,
        residual: usize,
        num_blocks: u32,
    ) -> Result<()> {
        // allocation batches are 64-block aligned, so the run is contiguous
        // in the mapping
        debug_assert!(
            (logical_idx.0 % 64) + num_blocks <= 64,
            "shadow run straddles an allocation batch"
        );
        let dst = self.file.data_ptr(logical_idx)?;

        if head > 0 {
            let old = self.file.btable.get(virtual_idx);
            unsafe {
                if old.0 == 0 {
                    std::ptr::write_bytes(dst, 0, head);
                } else {
                    let src = self.file.data_ptr(old)?;
                    std::ptr::copy_nonoverlapping(src, dst, head);
                }
            }
        }

        if residual > 0 {
            let last_virtual = VirtualBlockIdx(virtual_idx.0 + num_blocks - 1);
            let old = self.file.btable.get(last_virtual);
            let tail_offset = (num_blocks as usize - 1) * BLOCK_SIZE + (BLOCK_SIZE - residual);
            unsafe {
                let tail_dst = dst.add(tail_offset);
                if old.0 == 0 {
                    std::ptr::write_bytes(tail_dst, 0, residual);
                } else {
                    let src = self.file.data_ptr(old)?;
                    std::ptr::copy_nonoverlapping(
                        src.add(BLOCK_SIZE - residual),
                        tail_dst,
                        residual,
                    );
                }
            }
        }

        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), dst.add(head), buf.len());
        }
        crate::pmem::persist_range(dst, num_blocks as usize * BLOCK_SIZE);
        Ok(())
    }

    /// Brings the block table up to date if the tx stream moved, returning
    /// the current `(tail, file_size)`.
    pub(crate) fn sync_table(&mut self) -> Result<(TxCursor, u64)> {
        let mut published = (TxCursor::default(), 0);
        if self
            .file
            .btable
            .need_update(&self.file, Some(&mut self.alloc), &mut published)?
        {
            let _guard = self.file.lock_meta();
            self.file.btable.update(&self.file, false)
        } else {
            Ok(published)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::sync::Arc;

    fn test_file(name: &str) -> Arc<crate::File> {
        let _ = env_logger::try_init();
        let dir = std::path::Path::new("testing_data_directories").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let config = Config {
            path: dir.join("data.lapis"),
            ..Default::default()
        };
        config.open().unwrap()
    }

    #[test]
    fn uncommitted_write_is_invisible_until_the_commit_lands() {
        // a write torn between "data and log entry persisted" and "commit
        // entry placed" must replay to the pre-write state
        let file = test_file("torn_write");
        let mut handle = file.handle();

        handle.pwrite(&[b'A'; BLOCK_SIZE], 0).unwrap();
        assert_eq!(file.size().unwrap(), BLOCK_SIZE as u64);

        // by hand: begin entry, shadow block, log entry -- no commit
        let (tail, _) = handle.sync_table().unwrap();
        let begin = TxEntry::Begin {
            virtual_idx: VirtualBlockIdx(0),
            num_blocks: 1,
        };
        let begin_cursor = file
            .tx_try_append(tail, begin.encode(), &mut handle.alloc)
            .unwrap();

        let logical_idx = handle.alloc.alloc(1).unwrap();
        let dst = file.data_ptr(logical_idx).unwrap();
        unsafe {
            std::ptr::write_bytes(dst, b'B', BLOCK_SIZE);
        }
        crate::pmem::persist_range(dst, BLOCK_SIZE);
        let log_entry = handle
            .log_mgr
            .append(
                &mut handle.alloc,
                LogEntry {
                    op: LOG_OP_OVERWRITE,
                    last_block_residual: 0,
                    virtual_idx: VirtualBlockIdx(0),
                    logical_idx,
                    size: BLOCK_SIZE as u32,
                },
            )
            .unwrap();

        let mut buf = [0u8; BLOCK_SIZE];
        file.pread(&mut buf, 0).unwrap();
        assert_eq!(buf, [b'A'; BLOCK_SIZE], "torn write leaked");
        assert_eq!(file.size().unwrap(), BLOCK_SIZE as u64);

        // now the commit arrives and the write becomes visible
        let commit = TxEntry::CommitIndirect {
            log_entry,
            begin_hint: begin_cursor.local,
        };
        file.tx_try_append(begin_cursor.successor(), commit.encode(), &mut handle.alloc)
            .unwrap();

        file.pread(&mut buf, 0).unwrap();
        assert_eq!(buf, [b'B'; BLOCK_SIZE]);
        file.unlink_shm();
    }

    #[test]
    fn replay_is_idempotent() {
        let file = test_file("idempotent_replay");
        let mut handle = file.handle();
        handle.pwrite(b"some unaligned payload", 100).unwrap();
        handle.pwrite(&[b'Z'; BLOCK_SIZE * 3], 8192).unwrap();

        let guard = file.lock_meta();
        let first = file.btable.update(&file, false).unwrap();
        let second = file.btable.update(&file, false).unwrap();
        drop(guard);

        assert_eq!(first, second);
        let mapped: Vec<_> = (0..6)
            .map(|i| file.btable.get(VirtualBlockIdx(i)))
            .collect();
        let guard = file.lock_meta();
        file.btable.update(&file, false).unwrap();
        drop(guard);
        let remapped: Vec<_> = (0..6)
            .map(|i| file.btable.get(VirtualBlockIdx(i)))
            .collect();
        assert_eq!(mapped, remapped);
        file.unlink_shm();
    }
}
