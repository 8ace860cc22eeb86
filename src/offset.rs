//! The offset manager serializes relative reads and writes on one file.
//! Each operation takes a monotonically increasing ticket while it holds
//! the meta lock, then runs lock-free; a small ring of cache-line-sized
//! slots publishes where in the tx stream each ticket ended up, so the next
//! ticket can verify it did not commit "before" its predecessor and redo
//! its append if it did. With strict serialization disabled the ring is
//! never touched.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::file::File;
use crate::idx::TxCursor;

pub(crate) const NUM_OFFSET_QUEUE_SLOT: usize = 64;

#[repr(align(64))]
struct TicketSlot {
    ticket: AtomicU64,
    /// Packed `TxCursor`; valid once `ticket` matches.
    cursor: AtomicU64,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: TicketSlot = TicketSlot {
    ticket: AtomicU64::new(0),
    cursor: AtomicU64::new(0),
};

pub(crate) struct OffsetMgr {
    offset: AtomicU64,
    next_ticket: AtomicU64,
    slots: [TicketSlot; NUM_OFFSET_QUEUE_SLOT],
    strict: bool,
}

impl OffsetMgr {
    pub fn new(strict: bool) -> OffsetMgr {
        OffsetMgr {
            offset: AtomicU64::new(0),
            next_ticket: AtomicU64::new(1),
            slots: [EMPTY_SLOT; NUM_OFFSET_QUEUE_SLOT],
            strict,
        }
    }

    /// Caller holds the meta lock.
    pub fn seek_absolute(&self, offset: u64) -> u64 {
        self.offset.store(offset, Ordering::Relaxed);
        offset
    }

    /// Caller holds the meta lock.
    pub fn seek_relative(&self, delta: i64) -> Result<u64> {
        let current = self.offset.load(Ordering::Relaxed) as i64;
        let target = current.checked_add(delta).ok_or(Error::InvalidOffset)?;
        if target < 0 {
            return Err(Error::InvalidOffset);
        }
        Ok(self.seek_absolute(target as u64))
    }

    /// Advances the shared offset by `count` (clamping to `file_size` when
    /// `stop_at_boundary` is set, writing the possibly reduced count back)
    /// and issues the operation's ticket. Caller holds the meta lock.
    pub fn acquire(&self, count: &mut u64, file_size: u64, stop_at_boundary: bool) -> (u64, u64) {
        let old = self.offset.load(Ordering::Relaxed);
        let mut new = old + *count;
        if stop_at_boundary && new > file_size {
            new = file_size.max(old);
            *count = new - old;
        }
        self.offset.store(new, Ordering::Relaxed);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        (old, ticket)
    }

    /// Spins until the previous ticket has published, returning its
    /// serialization point. `None` when there is nothing to order against.
    pub fn wait(&self, ticket: u64) -> Option<TxCursor> {
        if !self.strict {
            return None;
        }
        let prev = ticket - 1;
        if prev == 0 {
            return None;
        }
        let slot = &self.slots[prev as usize % NUM_OFFSET_QUEUE_SLOT];
        while slot.ticket.load(Ordering::Acquire) != prev {
            std::hint::spin_loop();
        }
        Some(TxCursor::from_word(slot.cursor.load(Ordering::Relaxed)))
    }

    /// True when this operation's serialization point does not precede its
    /// predecessor's, i.e. the two became visible in ticket order. On false
    /// the caller redoes its tx append and validates again.
    pub fn validate(&self, file: &File, ticket: u64, point: TxCursor) -> bool {
        match self.wait(ticket) {
            None => true,
            Some(prev) => file.cursor_le(prev, point),
        }
    }

    /// Publishes this ticket's serialization point. Writers pass the slot
    /// after their commit entry; readers pass the tail they observed.
    pub fn release(&self, ticket: u64, point: TxCursor) {
        if !self.strict {
            return;
        }
        let slot = &self.slots[ticket as usize % NUM_OFFSET_QUEUE_SLOT];
        slot.cursor.store(point.to_word(), Ordering::Relaxed);
        slot.ticket.store(ticket, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_clamps_at_boundary() {
        let mgr = OffsetMgr::new(true);
        let mut count = 100;
        let (old, t1) = mgr.acquire(&mut count, 64, true);
        assert_eq!((old, count, t1), (0, 64, 1));

        let mut count = 10;
        let (old, t2) = mgr.acquire(&mut count, 64, true);
        assert_eq!((old, count, t2), (64, 0, 2));

        // writes ignore the boundary
        let mut count = 10;
        let (old, _) = mgr.acquire(&mut count, 64, false);
        assert_eq!((old, count), (64, 10));
    }

    #[test]
    fn seek_rejects_negative_offsets() {
        let mgr = OffsetMgr::new(true);
        mgr.seek_absolute(5);
        assert!(matches!(mgr.seek_relative(-6), Err(Error::InvalidOffset)));
        assert_eq!(mgr.seek_relative(-5).unwrap(), 0);
    }

    #[test]
    fn first_ticket_never_waits() {
        let mgr = OffsetMgr::new(true);
        let mut count = 1;
        let (_, ticket) = mgr.acquire(&mut count, 0, false);
        assert_eq!(mgr.wait(ticket), None);
    }

    #[test]
    fn lax_mode_skips_the_ring() {
        let mgr = OffsetMgr::new(false);
        // ticket 2 would spin forever in strict mode since 1 never released
        let mut count = 1;
        let _ = mgr.acquire(&mut count, 0, false);
        let mut count = 1;
        let (_, t2) = mgr.acquire(&mut count, 0, false);
        assert_eq!(mgr.wait(t2), None);
    }
}
