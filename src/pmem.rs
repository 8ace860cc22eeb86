//! Persistence primitives. On persistent memory, durability is a matter of
//! flushing the cache lines that cover a store and fencing; there is no
//! fsync anywhere in this crate.

pub const CACHELINE_SIZE: usize = 64;

/// Flush every cache line covering `[ptr, ptr + len)` and issue a store
/// fence. After this returns the bytes are durable on PMEM.
///
/// On non-x86 targets there is no usable flush intrinsic, so this degrades
/// to a full fence; tests still exercise the ordering, just not the
/// eviction.
pub fn persist_range(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        let start = (ptr as usize) & !(CACHELINE_SIZE - 1);
        let end = ptr as usize + len;
        let mut line = start;
        while line < end {
            core::arch::x86_64::_mm_clflush(line as *const u8);
            line += CACHELINE_SIZE;
        }
        core::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (ptr, len);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// A store fence on its own, for callers that flushed lines individually.
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// A mapped block of persistent memory: a typed handle around the base
/// pointer of one `BLOCK_SIZE` region. The handle is `Copy` and carries no
/// lifetime of its own; the memory table that produced it keeps the mapping
/// alive for as long as the owning file.
#[derive(Debug, Clone, Copy)]
pub struct BlockPtr {
    ptr: *mut u8,
}

impl BlockPtr {
    /// Safety: `ptr` must point at the start of a mapped, block-sized and
    /// block-aligned region that stays mapped for the life of the file.
    pub(crate) unsafe fn new(ptr: *mut u8) -> BlockPtr {
        debug_assert_eq!(ptr as usize % crate::layout::BLOCK_SIZE, 0);
        BlockPtr { ptr }
    }

    pub(crate) fn data(self) -> *mut u8 {
        self.ptr
    }

    /// Flush a sub-range of this block.
    pub(crate) fn persist(self, offset: usize, len: usize) {
        debug_assert!(offset + len <= crate::layout::BLOCK_SIZE);
        persist_range(unsafe { self.ptr.add(offset) }, len);
    }

    /// Safety: the block must actually hold the named layout. The returned
    /// reference is only ever used at `&self` through atomics, so shared
    /// access from many threads is sound.
    pub(crate) unsafe fn as_meta<'a>(self) -> &'a crate::layout::MetaBlock {
        &*(self.ptr as *const crate::layout::MetaBlock)
    }

    pub(crate) unsafe fn as_bitmap<'a>(self) -> &'a crate::layout::BitmapBlock {
        &*(self.ptr as *const crate::layout::BitmapBlock)
    }

    pub(crate) unsafe fn as_tx<'a>(self) -> &'a crate::layout::TxBlock {
        &*(self.ptr as *const crate::layout::TxBlock)
    }
}

unsafe impl Send for BlockPtr {}
unsafe impl Sync for BlockPtr {}
