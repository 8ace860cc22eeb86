//! The read path: translate each virtual block through the table, copy out,
//! and treat unmapped blocks as holes full of zeroes. `pread` lives on the
//! shared `File` since it never allocates; the relative `read` and `lseek`
//! go through the handle and the ticketed serializer.

use std::sync::Arc;

use crate::error::Result;
use crate::file::File;
use crate::idx::{TxCursor, VirtualBlockIdx};
use crate::layout::{BLOCK_SHIFT, BLOCK_SIZE};
use crate::FileHandle;

/// `lseek` origins, mirroring SEEK_SET / SEEK_CUR / SEEK_END.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl File {
    /// Reads up to `buf.len()` bytes at `offset`, clamped to the file size.
    /// Returns the number of bytes read.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut published = (TxCursor::default(), 0);
        let file_size = if self.btable.need_update(self, None, &mut published)? {
            let _guard = self.lock_meta();
            self.btable.update(self, false)?.1
        } else {
            published.1
        };

        if offset >= file_size {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(file_size - offset) as usize;
        self.copy_out(&mut buf[..n], offset)?;
        Ok(n)
    }

    pub(crate) fn copy_out(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = offset + done as u64;
            let virtual_idx = VirtualBlockIdx((at >> BLOCK_SHIFT) as u32);
            let within = (at % BLOCK_SIZE as u64) as usize;
            let n = (buf.len() - done).min(BLOCK_SIZE - within);
            let logical_idx = self.btable.get(virtual_idx);
            if logical_idx.0 == 0 {
                buf[done..done + n].fill(0);
            } else {
                let src = self.data_ptr(logical_idx)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(src.add(within), buf[done..].as_mut_ptr(), n);
                }
            }
            done += n;
        }
        Ok(())
    }
}

impl FileHandle {
    /// Reads from the shared file offset, advancing it. Stops at the file
    /// boundary; returns the number of bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut count = buf.len() as u64;
        let (offset, ticket, mut point) = {
            let _guard = self.file.lock_meta();
            let (tail, file_size) = self.file.btable.update(&self.file, false)?;
            let (offset, ticket) = self.file.offset_mgr.acquire(&mut count, file_size, true);
            (offset, ticket, tail)
        };

        let n = count as usize;
        let result: Result<()> = (|| {
            self.file.copy_out(&mut buf[..n], offset)?;
            while !self.file.offset_mgr.validate(&self.file, ticket, point) {
                // the predecessor committed past what we saw; fold its
                // write in and read again
                log::trace!("ticket {} re-reading after a racing commit", ticket);
                let guard = self.file.lock_meta();
                let (tail, _) = self.file.btable.update(&self.file, false)?;
                point = tail;
                drop(guard);
                self.file.copy_out(&mut buf[..n], offset)?;
            }
            Ok(())
        })();

        // a ticket must always release or its successors spin
        self.file.offset_mgr.release(ticket, point);
        result.map(|()| n)
    }

    /// Repositions the shared file offset. Negative results are rejected
    /// with `InvalidOffset`, matching lseek's EINVAL.
    pub fn lseek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let _guard = self.file.lock_meta();
        match whence {
            Whence::Set => {
                if offset < 0 {
                    return Err(crate::error::Error::InvalidOffset);
                }
                Ok(self.file.offset_mgr.seek_absolute(offset as u64))
            }
            Whence::Cur => self.file.offset_mgr.seek_relative(offset),
            Whence::End => {
                let (_, file_size) = self.file.btable.update(&self.file, false)?;
                let target = file_size as i64 + offset;
                if target < 0 {
                    return Err(crate::error::Error::InvalidOffset);
                }
                Ok(self.file.offset_mgr.seek_absolute(target as u64))
            }
        }
    }

    /// The file this handle operates on.
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}
