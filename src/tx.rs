//! Transaction stream operations. Tx entries fill the meta block's inline
//! arena first, then a singly-linked chain of tx blocks. Slots only ever
//! transition zero -> entry, installed by CAS, so the stream read in slot
//! order is prefix-consistent: recovery truncates at the first zero slot
//! and never sees a hole, because a writer claims a slot only after
//! observing every earlier slot non-zero.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::alloc::Allocator;
use crate::debug_delay::debug_delay;
use crate::error::{Error, Result};
use crate::idx::{LogEntryIdx, LogicalBlockIdx, TxCursor};
use crate::layout::{
    BLOCK_SIZE, LOG_ENTRY_SIZE, NUM_INLINE_TX_ENTRIES, NUM_LOG_ENTRIES, NUM_TX_ENTRIES,
};
use crate::pmem::{persist_range, CACHELINE_SIZE};

/// Upper bound when walking the tx chain to order two cursors; a chain this
/// long means gigabytes of committed history in one file.
const MAX_CHAIN_WALK: usize = 1 << 20;

impl crate::file::File {
    pub(crate) fn tx_arena_len(block: LogicalBlockIdx) -> u32 {
        if block.0 == 0 {
            NUM_INLINE_TX_ENTRIES as u32
        } else {
            NUM_TX_ENTRIES as u32
        }
    }

    /// The tx entry slot under `cursor`, which must lie within its arena.
    pub(crate) fn tx_slot(&self, cursor: TxCursor) -> Result<&AtomicU64> {
        debug_assert!(cursor.local < Self::tx_arena_len(cursor.block));
        if cursor.block.0 == 0 {
            Ok(&self.meta().inline_tx_entries[cursor.local as usize])
        } else {
            Ok(&self.tx_block(cursor.block)?.entries[cursor.local as usize])
        }
    }

    /// A mapped view of a chained tx block, remapping if another handle
    /// grew the file past our mapping.
    pub(crate) fn tx_block(&self, block: LogicalBlockIdx) -> Result<&crate::layout::TxBlock> {
        let ptr = match self.mtable().get(block) {
            Ok(ptr) => ptr,
            Err(Error::OutOfRange(_)) => {
                self.mtable().remap_to(u64::from(block.0) + 1)?;
                self.mtable().get(block)?
            }
            Err(e) => return Err(e),
        };
        Ok(unsafe { ptr.as_tx() })
    }

    /// If `cursor` sits past the end of its arena, push it into the next
    /// chained block, allocating and linking one when `alloc` is provided
    /// and the chain ends here. Returns false when the cursor cannot
    /// advance, i.e. it already points at the end of history.
    pub(crate) fn handle_idx_overflow(
        &self,
        cursor: &mut TxCursor,
        mut alloc: Option<&mut Allocator>,
    ) -> Result<bool> {
        loop {
            if cursor.local < Self::tx_arena_len(cursor.block) {
                return Ok(true);
            }

            let next_field: &AtomicU32 = if cursor.block.0 == 0 {
                &self.meta().log_head
            } else {
                &self.tx_block(cursor.block)?.next
            };

            let mut next = next_field.load(Ordering::Acquire);
            if next == 0 {
                let Some(alloc) = alloc.as_deref_mut() else {
                    return Ok(false);
                };
                let fresh = alloc.alloc(1)?;
                self.init_tx_block(fresh, cursor.block)?;
                match next_field.compare_exchange(
                    0,
                    fresh.0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        log::trace!("chained tx block {} after {}", fresh, cursor.block);
                        next = fresh.0;
                    }
                    Err(winner) => {
                        alloc.free(fresh, 1);
                        next = winner;
                    }
                }
                self.meta().log_tail.store(next, Ordering::Release);
            }

            // the link and the final entries of the block we leave must be
            // durable before anything we later commit in the next block;
            // otherwise recovery could truncate in front of an
            // acknowledged commit
            persist_range(next_field.as_ptr() as *const u8, 4);
            self.persist_last_tx_line(cursor.block)?;

            *cursor = TxCursor {
                block: LogicalBlockIdx(next),
                local: 0,
            };
        }
    }

    fn init_tx_block(&self, block: LogicalBlockIdx, prev: LogicalBlockIdx) -> Result<()> {
        let ptr = match self.mtable().get(block) {
            Ok(ptr) => ptr,
            Err(Error::OutOfRange(_)) => {
                self.mtable().remap_to(u64::from(block.0) + 1)?;
                self.mtable().get(block)?
            }
            Err(e) => return Err(e),
        };
        unsafe {
            std::ptr::write_bytes(ptr.data(), 0, BLOCK_SIZE);
        }
        let tx_block = unsafe { ptr.as_tx() };
        tx_block.prev.store(prev.0, Ordering::Release);
        ptr.persist(0, BLOCK_SIZE);
        Ok(())
    }

    fn persist_last_tx_line(&self, block: LogicalBlockIdx) -> Result<()> {
        let base = if block.0 == 0 {
            self.meta() as *const _ as *const u8
        } else {
            self.tx_block(block)? as *const _ as *const u8
        };
        persist_range(
            unsafe { base.add(BLOCK_SIZE - CACHELINE_SIZE) },
            CACHELINE_SIZE,
        );
        Ok(())
    }

    /// CAS-places `word` at the first empty slot at or after `start`,
    /// extending the chain as needed, and persists it. Returns the cursor
    /// of the installed entry.
    pub(crate) fn tx_try_append(
        &self,
        start: TxCursor,
        word: u64,
        alloc: &mut Allocator,
    ) -> Result<TxCursor> {
        debug_assert_ne!(word, 0);
        let mut cursor = start;
        loop {
            self.handle_idx_overflow(&mut cursor, Some(alloc))?;
            let arena = Self::tx_arena_len(cursor.block);
            while cursor.local < arena {
                let slot = self.tx_slot(cursor)?;
                if slot.load(Ordering::Acquire) == 0 {
                    debug_delay();
                    if slot
                        .compare_exchange(0, word, Ordering::Release, Ordering::Acquire)
                        .is_ok()
                    {
                        // flush the previous slot's line too: it is full
                        // (we scanned past it) but its writer may not have
                        // flushed yet, and our ack must not outlive it
                        let from = cursor.local.saturating_sub(1);
                        let first =
                            TxCursor { block: cursor.block, local: from };
                        let base = self.tx_slot(first)? as *const AtomicU64 as *const u8;
                        persist_range(base, ((cursor.local - from + 1) * 8) as usize);
                        return Ok(cursor);
                    }
                }
                cursor.local += 1;
            }
        }
    }

    /// `a <= b` in stream order. Cursors in the same arena compare by slot;
    /// the inline arena precedes every chained block; otherwise `b` must be
    /// reachable from `a` along `next` links.
    pub(crate) fn cursor_le(&self, a: TxCursor, b: TxCursor) -> bool {
        if a.block == b.block {
            return a.local <= b.local;
        }
        if a.block.0 == 0 {
            return true;
        }
        if b.block.0 == 0 {
            return false;
        }
        let mut current = a.block;
        for _ in 0..MAX_CHAIN_WALK {
            let next = match self.tx_block(current) {
                Ok(tx_block) => tx_block.next.load(Ordering::Acquire),
                Err(_) => return false,
            };
            if next == 0 {
                return false;
            }
            if next == b.block.0 {
                return true;
            }
            current = LogicalBlockIdx(next);
        }
        log::warn!("tx chain walk exceeded {} blocks", MAX_CHAIN_WALK);
        false
    }

    /// The 16 bytes under a log entry index.
    pub(crate) fn log_entry_ptr(&self, idx: LogEntryIdx) -> Result<*mut u8> {
        debug_assert!((idx.local as usize) < NUM_LOG_ENTRIES);
        let ptr = match self.mtable().get(idx.block) {
            Ok(ptr) => ptr,
            Err(Error::OutOfRange(_)) => {
                self.mtable().remap_to(u64::from(idx.block.0) + 1)?;
                self.mtable().get(idx.block)?
            }
            Err(e) => return Err(e),
        };
        Ok(unsafe { ptr.data().add(idx.local as usize * LOG_ENTRY_SIZE) })
    }

    pub(crate) fn read_log_entry(&self, idx: LogEntryIdx) -> Result<crate::entry::LogEntry> {
        let ptr = self.log_entry_ptr(idx)?;
        let mut buf = [0u8; LOG_ENTRY_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), LOG_ENTRY_SIZE);
        }
        crate::entry::LogEntry::decode(buf)
    }
}
