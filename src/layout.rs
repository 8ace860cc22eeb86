//! On-PMEM block layout. Every structure here is overlaid onto mapped
//! persistent memory, so sizes and field offsets are fixed and little-endian
//! regardless of host. Nothing in this module is ever constructed by value;
//! blocks are only ever viewed through pointers handed out by the memory
//! table.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64};

pub const BLOCK_SHIFT: u32 = 12;
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT; // 4096

/// 64-bit bitmap words per bitmap block.
pub const NUM_BITMAP_WORDS: usize = BLOCK_SIZE / size_of::<u64>(); // 512

/// Bitmap words inlined in the meta block (3 cache lines, 1536 blocks).
pub const NUM_INLINE_BITMAP_WORDS: usize = 24;

/// Tx entries inlined in the meta block (60 cache lines).
pub const NUM_INLINE_TX_ENTRIES: usize = 480;

/// Tx entries per chained tx block; the first 8 bytes hold the links.
pub const NUM_TX_ENTRIES: usize = (BLOCK_SIZE - 2 * size_of::<u32>()) / size_of::<u64>(); // 511

pub const LOG_ENTRY_SIZE: usize = 16;
pub const NUM_LOG_ENTRIES: usize = BLOCK_SIZE / LOG_ENTRY_SIZE; // 256

/// Bitmap blocks formatted right after the meta block at creation time.
/// Together with the inline words this caps the file at
/// `(24 + 8 * 512) * 64` = 263,680 blocks, a little over 1 GiB.
pub const NUM_BITMAP_BLOCKS: usize = 8;

pub const TOTAL_BITMAP_WORDS: usize = NUM_INLINE_BITMAP_WORDS + NUM_BITMAP_BLOCKS * NUM_BITMAP_WORDS;

pub const CAPACITY_BLOCKS: u64 = (TOTAL_BITMAP_WORDS as u64) * 64;

/// The file grows and maps in units of 512 blocks (2 MiB). Allocation
/// batches are 64-block aligned, so a contiguous run handed out by the
/// allocator never straddles a growth-unit boundary and is therefore
/// contiguous in the mapping as well.
pub const GROW_UNIT_BLOCKS: u64 = 512;

pub const BITMAP_ALL_USED: u64 = u64::MAX;

/// Logical block 0. The first cache line carries the mutable header fields;
/// the remaining 63 lines split between inline bitmaps and inline tx
/// entries so that small files never touch a second metadata block.
#[repr(C)]
pub struct MetaBlock {
    /// File size in bytes; updated by the meta lock holder, monotonic
    /// under appends.
    pub file_size: AtomicU64,

    /// Futex word backing the per-file spinlock.
    pub meta_lock: AtomicU32,

    /// Bitmap blocks immediately following this block; fixed at format
    /// time.
    pub num_bitmap_blocks: AtomicU32,

    /// First chained tx block once the inline entries are used up; zero
    /// until then. Written once via CAS.
    pub log_head: AtomicU32,

    /// Best-effort hint for the tx tail; scanning corrects for staleness.
    pub log_tail: AtomicU32,

    _pad: [u8; 40],

    pub inline_bitmaps: [AtomicU64; NUM_INLINE_BITMAP_WORDS],

    pub inline_tx_entries: [AtomicU64; NUM_INLINE_TX_ENTRIES],
}

/// One bit per logical block; set means allocated.
#[repr(C)]
pub struct BitmapBlock {
    pub words: [AtomicU64; NUM_BITMAP_WORDS],
}

/// A chained arena of tx entries. `prev` is written once before the block
/// is published; `next` transitions zero -> block idx exactly once via CAS.
#[repr(C)]
pub struct TxBlock {
    pub prev: AtomicU32,
    pub next: AtomicU32,
    pub entries: [AtomicU64; NUM_TX_ENTRIES],
}

const _: () = assert!(size_of::<MetaBlock>() == BLOCK_SIZE);
const _: () = assert!(size_of::<BitmapBlock>() == BLOCK_SIZE);
const _: () = assert!(size_of::<TxBlock>() == BLOCK_SIZE);
const _: () = assert!(NUM_LOG_ENTRIES * LOG_ENTRY_SIZE == BLOCK_SIZE);
