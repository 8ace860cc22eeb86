//! Block allocation. The shared state is one bit per logical block, spread
//! over the meta block's inline words and the dedicated bitmap blocks that
//! follow it. Each thread runs its own `Allocator` holding a small cache of
//! pre-reserved runs, so the shared words are only touched when the cache
//! misses, and then only with CAS.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::debug_delay::debug_delay;
use crate::error::{Error, Result};
use crate::file::File;
use crate::idx::LogicalBlockIdx;
use crate::layout::{
    BITMAP_ALL_USED, NUM_BITMAP_WORDS, NUM_INLINE_BITMAP_WORDS, TOTAL_BITMAP_WORDS,
};

/// Largest contiguous run a single allocation may request. Also the batch
/// size reserved from the shared bitmap in one CAS.
pub(crate) const MAX_ALLOC_BLOCKS: u32 = 64;

/// Per-thread allocator state. The free list holds `(run_len, start)`
/// pairs sorted by ascending length; with runs capped at 64 blocks it
/// stays short enough that a sorted vec beats anything fancier.
pub(crate) struct Allocator {
    file: Arc<File>,
    free_list: Vec<(u32, LogicalBlockIdx)>,
    /// Next shared word to probe. Purely a hint; correctness never
    /// depends on it.
    recent_word: usize,
}

impl Allocator {
    pub fn new(file: Arc<File>) -> Allocator {
        Allocator {
            file,
            free_list: Vec::with_capacity(MAX_ALLOC_BLOCKS as usize),
            recent_word: 0,
        }
    }

    /// Allocates `num_blocks` contiguous logical blocks, growing the file
    /// mapping to cover them. `num_blocks` must be in `1..=64`.
    pub fn alloc(&mut self, num_blocks: u32) -> Result<LogicalBlockIdx> {
        assert!(num_blocks >= 1 && num_blocks <= MAX_ALLOC_BLOCKS);
        loop {
            if let Some(pos) = self
                .free_list
                .iter()
                .position(|(len, _)| *len >= num_blocks)
            {
                let (len, start) = self.free_list.remove(pos);
                if len > num_blocks {
                    self.insert_run(len - num_blocks, LogicalBlockIdx(start.0 + num_blocks));
                }
                self.file.ensure_blocks(u64::from(start.0) + u64::from(num_blocks))?;
                return Ok(start);
            }
            let (len, start) = self.acquire_from_bitmap()?;
            self.insert_run(len, start);
        }
    }

    /// Returns a run to the local cache. There is no path back to the
    /// shared bitmap here; orphaned reservations are the garbage
    /// collector's to reclaim via `drain_to_bitmap`.
    pub fn free(&mut self, start: LogicalBlockIdx, num_blocks: u32) {
        self.insert_run(num_blocks, start);
    }

    /// Clears the shared bitmap bits for every cached run and empties the
    /// cache. Exposed for the external garbage collector; the core never
    /// calls it on its own.
    pub fn drain_to_bitmap(&mut self) {
        for (len, start) in std::mem::take(&mut self.free_list) {
            for i in 0..len {
                self.file.bitmap_clear(LogicalBlockIdx(start.0 + i));
            }
        }
    }

    fn insert_run(&mut self, len: u32, start: LogicalBlockIdx) {
        let pos = self
            .free_list
            .iter()
            .position(|(l, _)| *l >= len)
            .unwrap_or(self.free_list.len());
        self.free_list.insert(pos, (len, start));
    }

    /// Reserves one batch from the shared bitmap: a whole 64-block aligned
    /// group when a word is empty, otherwise a single block at the lowest
    /// zero bit of a partial word. Singles go into the cache; a caller
    /// needing a longer run keeps scanning until an empty word turns up,
    /// so fragmented-but-adjacent bits are never fused into a run.
    fn acquire_from_bitmap(&mut self) -> Result<(u32, LogicalBlockIdx)> {
        let mut word_idx = self.recent_word;
        while word_idx < TOTAL_BITMAP_WORDS {
            let word = self.file.bitmap_word(word_idx);
            let mut observed = word.load(Ordering::Acquire);
            loop {
                debug_delay();
                if observed == BITMAP_ALL_USED {
                    break;
                }
                if observed == 0 {
                    match word.compare_exchange(
                        0,
                        BITMAP_ALL_USED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.recent_word = word_idx;
                            log::trace!("reserved batch of 64 at word {}", word_idx);
                            return Ok((64, LogicalBlockIdx((word_idx * 64) as u32)));
                        }
                        Err(actual) => {
                            observed = actual;
                            continue;
                        }
                    }
                }
                let lowest_zero = !observed & (observed + 1);
                match word.compare_exchange(
                    observed,
                    observed | lowest_zero,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.recent_word = word_idx;
                        let bit = observed.trailing_ones();
                        return Ok((1, LogicalBlockIdx((word_idx * 64) as u32 + bit)));
                    }
                    Err(actual) => observed = actual,
                }
            }
            word_idx += 1;
        }
        // the hint may have skipped earlier words freed by drain_to_bitmap
        if self.recent_word != 0 {
            self.recent_word = 0;
            return self.acquire_from_bitmap();
        }
        Err(Error::NoSpace)
    }
}

impl File {
    /// The shared bitmap word with global index `word_idx`. The first 24
    /// words live inline in the meta block; the rest fill the bitmap
    /// blocks, which sit right after the meta block and are always mapped.
    pub(crate) fn bitmap_word(&self, word_idx: usize) -> &AtomicU64 {
        debug_assert!(word_idx < TOTAL_BITMAP_WORDS);
        if word_idx < NUM_INLINE_BITMAP_WORDS {
            &self.meta().inline_bitmaps[word_idx]
        } else {
            let rel = word_idx - NUM_INLINE_BITMAP_WORDS;
            let block = LogicalBlockIdx(1 + (rel / NUM_BITMAP_WORDS) as u32);
            let ptr = self
                .mtable()
                .get(block)
                .expect("bitmap blocks are mapped at open");
            let bitmap = unsafe { ptr.as_bitmap() };
            &bitmap.words[rel % NUM_BITMAP_WORDS]
        }
    }

    pub(crate) fn bitmap_set(&self, idx: LogicalBlockIdx) {
        let word = self.bitmap_word(idx.0 as usize / 64);
        word.fetch_or(1 << (idx.0 % 64), Ordering::AcqRel);
    }

    pub(crate) fn bitmap_clear(&self, idx: LogicalBlockIdx) {
        let word = self.bitmap_word(idx.0 as usize / 64);
        word.fetch_and(!(1 << (idx.0 % 64)), Ordering::AcqRel);
    }

    /// Zeroes the whole bitmap and re-seeds the bits for the meta block and
    /// the bitmap blocks themselves. Used once per open, before replaying
    /// the tx stream re-marks every reachable block.
    pub(crate) fn bitmap_reset(&self) {
        for word_idx in 0..TOTAL_BITMAP_WORDS {
            self.bitmap_word(word_idx).store(0, Ordering::Release);
        }
        for block in 0..=self.num_bitmap_blocks() {
            self.bitmap_set(LogicalBlockIdx(block));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU64;

    fn test_file(name: &str) -> Arc<File> {
        let dir = std::path::Path::new("testing_data_directories").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let config = crate::Config {
            path: dir.join("data.lapis"),
            ..Default::default()
        };
        config.open().unwrap()
    }

    #[test]
    fn free_list_splits_and_reuses() {
        let file = test_file("alloc_free_list");
        let mut alloc = Allocator::new(file.clone());

        let a = alloc.alloc(10).unwrap();
        // remainder of the 64-block batch satisfies the next request
        // without touching the shared bitmap
        let b = alloc.alloc(54).unwrap();
        assert_eq!(b.0, a.0 + 10);

        alloc.free(a, 10);
        let c = alloc.alloc(4).unwrap();
        assert_eq!(c.0, a.0);
        file.unlink_shm();
    }

    #[test]
    fn concurrent_single_block_allocs_never_collide() {
        // 64 threads x 1000 single-block allocations: all distinct
        let file = test_file("alloc_stress");
        let mut threads = vec![];
        for _ in 0..64 {
            let file = file.clone();
            threads.push(std::thread::spawn(move || {
                let mut alloc = Allocator::new(file);
                let mut got = Vec::with_capacity(1000);
                for _ in 0..1000 {
                    got.push(alloc.alloc(1).unwrap().0);
                }
                got
            }));
        }
        let mut seen = HashSet::new();
        for t in threads {
            for idx in t.join().unwrap() {
                assert!(seen.insert(idx), "block {} allocated twice", idx);
            }
        }
        assert_eq!(seen.len(), 64_000);
        file.unlink_shm();
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let file = test_file("alloc_exhaustion");
        // claim every word wholesale so the next request must fail
        for word_idx in 0..TOTAL_BITMAP_WORDS {
            let word: &AtomicU64 = file.bitmap_word(word_idx);
            word.store(BITMAP_ALL_USED, Ordering::Release);
        }
        let mut alloc = Allocator::new(file.clone());
        assert!(matches!(alloc.alloc(1), Err(Error::NoSpace)));
        file.unlink_shm();
    }
}
