//! The memory table maps logical block indices to host addresses. The file
//! is mapped in fixed 2 MiB chunks, one `MmapRaw` per chunk, so an address
//! handed out for a block stays valid for the life of the file no matter
//! how much it grows afterwards. Chunk base addresses publish through a
//! wait-free page table; only growth takes a lock.

use std::fs::File as StdFile;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use fault_injection::maybe;
use memmap2::{MmapOptions, MmapRaw};
use pagetable::PageTable;

use crate::error::{Error, Result};
use crate::idx::LogicalBlockIdx;
use crate::layout::{BLOCK_SHIFT, BLOCK_SIZE, GROW_UNIT_BLOCKS};
use crate::pmem::BlockPtr;

const GROW_UNIT_BYTES: u64 = GROW_UNIT_BLOCKS << BLOCK_SHIFT;

pub(crate) struct MemTable {
    file: StdFile,
    /// chunk index -> mapped base address; 0 means not mapped yet.
    chunk_addrs: PageTable<AtomicU64>,
    /// Keeps the mappings alive. Push-only, guarded for growth.
    maps: Mutex<Vec<MmapRaw>>,
    /// Number of logical blocks covered by the mapping so far.
    mapped_blocks: AtomicU64,
}

impl MemTable {
    /// Wraps an already-opened file and maps whatever it currently holds.
    /// The file length must be a whole number of growth units; the open
    /// path guarantees that by construction.
    pub fn new(file: StdFile) -> Result<MemTable> {
        let mt = MemTable {
            file,
            chunk_addrs: PageTable::<AtomicU64>::default(),
            maps: Mutex::new(vec![]),
            mapped_blocks: AtomicU64::new(0),
        };
        let len = maybe!(mt.file.metadata())?.len();
        if len > 0 {
            mt.remap_to(len >> BLOCK_SHIFT)?;
        }
        Ok(mt)
    }

    pub fn num_mapped_blocks(&self) -> u64 {
        self.mapped_blocks.load(Ordering::Acquire)
    }

    /// Extends the file so that at least `num_blocks` logical blocks exist,
    /// then maps them. Rounds up to the growth unit; idempotent. The caller
    /// must hold the meta lock, since a racing `set_len` from another
    /// process could otherwise move the file length backwards.
    pub fn grow_to(&self, num_blocks: u64) -> Result<()> {
        let target_bytes = align_up(num_blocks << BLOCK_SHIFT, GROW_UNIT_BYTES);
        let len = maybe!(self.file.metadata())?.len();
        if len < target_bytes {
            log::trace!("growing file from {} to {} bytes", len, target_bytes);
            maybe!(self.file.set_len(target_bytes))?;
        }
        self.remap_to(num_blocks)
    }

    /// Maps any growth units that exist in the file but are not yet in our
    /// address space. Purely local, so no lock is required: another handle
    /// or process may have grown the file underneath us.
    pub fn remap_to(&self, num_blocks: u64) -> Result<()> {
        if self.mapped_blocks.load(Ordering::Acquire) >= num_blocks {
            return Ok(());
        }
        let mut maps = self.maps.lock().unwrap();
        let mapped_chunks = maps.len() as u64;
        let len = maybe!(self.file.metadata())?.len();
        let target_blocks = align_up(num_blocks << BLOCK_SHIFT, GROW_UNIT_BYTES).min(len) >> BLOCK_SHIFT;
        let target_chunks = target_blocks / GROW_UNIT_BLOCKS;

        for chunk in mapped_chunks..target_chunks {
            let map = maybe!(MmapOptions::new()
                .offset(chunk * GROW_UNIT_BYTES)
                .len(GROW_UNIT_BYTES as usize)
                .map_raw(&self.file))?;
            self.chunk_addrs
                .get(chunk)
                .store(map.as_mut_ptr() as u64, Ordering::Release);
            maps.push(map);
        }
        self.mapped_blocks
            .store(target_chunks * GROW_UNIT_BLOCKS, Ordering::Release);
        Ok(())
    }

    /// The address of a mapped block. `OutOfRange` means the mapping has
    /// not caught up with `idx`; callers recover with `remap_to` or, if the
    /// file itself is too short, `grow_to`.
    pub fn get(&self, idx: LogicalBlockIdx) -> Result<BlockPtr> {
        let chunk = u64::from(idx.0) / GROW_UNIT_BLOCKS;
        let base = self.chunk_addrs.get(chunk).load(Ordering::Acquire);
        if base == 0 {
            return Err(Error::OutOfRange(idx));
        }
        let offset = (idx.0 as usize % GROW_UNIT_BLOCKS as usize) << BLOCK_SHIFT;
        Ok(unsafe { BlockPtr::new((base as *mut u8).add(offset)) })
    }
}

fn align_up(value: u64, to: u64) -> u64 {
    (value + to - 1) / to * to
}

const _: () = assert!(GROW_UNIT_BYTES as usize % BLOCK_SIZE == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_stay_stable_across_growth() {
        let dir = std::path::Path::new("testing_data_directories").join("mtable_growth");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join("data.lapis"))
            .unwrap();

        let mt = MemTable::new(file).unwrap();
        mt.grow_to(1).unwrap();
        let early = mt.get(LogicalBlockIdx(0)).unwrap().data();

        // growing by several chunks must not move what is already mapped
        mt.grow_to(GROW_UNIT_BLOCKS * 5).unwrap();
        assert_eq!(mt.get(LogicalBlockIdx(0)).unwrap().data(), early);
        assert!(mt.num_mapped_blocks() >= GROW_UNIT_BLOCKS * 5);

        assert!(matches!(
            mt.get(LogicalBlockIdx((GROW_UNIT_BLOCKS * 6) as u32)),
            Err(Error::OutOfRange(_))
        ));
    }
}
