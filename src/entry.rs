//! Wire encoding of tx entries (8 bytes) and log entries (16 bytes).
//!
//! A tx entry slot holds zero until exactly one writer CAS-installs a value,
//! so every valid encoding must be non-zero. The top bits discriminate:
//!
//! ```text
//! bit 63      = 1   inline commit:  num_blocks[62:57] virtual[56:29] logical[28:1]
//! bits 63..62 = 01  indirect commit: begin_hint[61:40] log_block[39:8] log_local[7:0]
//! bits 63..61 = 001 begin:          virtual[60:29] num_blocks[6:0]
//! ```
//!
//! Inline commits carry no byte count, so they are only emitted for writes
//! that are block-aligned at both ends; everything else references a log
//! entry, which is the single source of truth for `file_size`.

use crate::error::{Error, Result};
use crate::idx::{LogEntryIdx, LogicalBlockIdx, VirtualBlockIdx};
use crate::layout::{BLOCK_SHIFT, BLOCK_SIZE};

const TAG_INLINE: u64 = 1 << 63;
const TAG_INDIRECT: u64 = 1 << 62;
const TAG_BEGIN: u64 = 1 << 61;

/// Widest index an inline commit can carry; larger ones take the indirect
/// path.
pub(crate) const INLINE_IDX_MAX: u32 = (1 << 28) - 1;

/// Inline commits devote 6 bits to the block count.
pub(crate) const INLINE_NUM_BLOCKS_MAX: u32 = 63;

const BEGIN_HINT_MAX: u32 = (1 << 22) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEntry {
    /// Announces an in-flight write over a virtual range. Carries no state
    /// change; replay skips it.
    Begin {
        virtual_idx: VirtualBlockIdx,
        num_blocks: u32,
    },
    /// A whole-block write small enough to describe without a log entry.
    CommitInline {
        virtual_idx: VirtualBlockIdx,
        num_blocks: u32,
        logical_idx: LogicalBlockIdx,
    },
    /// Points at the log entry describing the committed write. `begin_hint`
    /// is the local slot of the matching begin entry, saturated.
    CommitIndirect {
        log_entry: LogEntryIdx,
        begin_hint: u32,
    },
}

impl TxEntry {
    pub fn encode(&self) -> u64 {
        match *self {
            TxEntry::Begin {
                virtual_idx,
                num_blocks,
            } => {
                debug_assert!(num_blocks >= 1 && num_blocks <= 64);
                TAG_BEGIN | (u64::from(virtual_idx.0) << 29) | u64::from(num_blocks)
            }
            TxEntry::CommitInline {
                virtual_idx,
                num_blocks,
                logical_idx,
            } => {
                debug_assert!(num_blocks >= 1 && num_blocks <= INLINE_NUM_BLOCKS_MAX);
                debug_assert!(virtual_idx.0 <= INLINE_IDX_MAX);
                debug_assert!(logical_idx.0 >= 1 && logical_idx.0 <= INLINE_IDX_MAX);
                TAG_INLINE
                    | (u64::from(num_blocks) << 57)
                    | (u64::from(virtual_idx.0) << 29)
                    | (u64::from(logical_idx.0) << 1)
            }
            TxEntry::CommitIndirect {
                log_entry,
                begin_hint,
            } => {
                debug_assert!(log_entry.block.0 != 0);
                TAG_INDIRECT
                    | (u64::from(begin_hint.min(BEGIN_HINT_MAX)) << 40)
                    | (u64::from(log_entry.block.0) << 8)
                    | u64::from(log_entry.local)
            }
        }
    }

    /// `Ok(None)` for an empty slot; `Err(Corrupt)` for a non-zero word
    /// that does not decode, which truncates the visible tx history there.
    pub fn decode(word: u64) -> Result<Option<TxEntry>> {
        if word == 0 {
            return Ok(None);
        }
        if word & TAG_INLINE != 0 {
            let num_blocks = ((word >> 57) & 0x3f) as u32;
            let virtual_idx = VirtualBlockIdx(((word >> 29) & u64::from(INLINE_IDX_MAX)) as u32);
            let logical_idx = LogicalBlockIdx(((word >> 1) & u64::from(INLINE_IDX_MAX)) as u32);
            if num_blocks == 0 || logical_idx.0 == 0 || word & 1 != 0 {
                return Err(Error::Corrupt { word });
            }
            return Ok(Some(TxEntry::CommitInline {
                virtual_idx,
                num_blocks,
                logical_idx,
            }));
        }
        if word & TAG_INDIRECT != 0 {
            let begin_hint = ((word >> 40) & u64::from(BEGIN_HINT_MAX)) as u32;
            let block = LogicalBlockIdx(((word >> 8) & 0xffff_ffff) as u32);
            let local = (word & 0xff) as u8;
            if block.0 == 0 {
                return Err(Error::Corrupt { word });
            }
            return Ok(Some(TxEntry::CommitIndirect {
                log_entry: LogEntryIdx { block, local },
                begin_hint,
            }));
        }
        if word & TAG_BEGIN != 0 {
            let virtual_idx = VirtualBlockIdx(((word >> 29) & 0xffff_ffff) as u32);
            let num_blocks = (word & 0x7f) as u32;
            if num_blocks == 0 || num_blocks > 64 {
                return Err(Error::Corrupt { word });
            }
            return Ok(Some(TxEntry::Begin {
                virtual_idx,
                num_blocks,
            }));
        }
        Err(Error::Corrupt { word })
    }
}

pub(crate) const LOG_OP_OVERWRITE: u16 = 0;

/// Describes the physical layout of one committed write: which virtual
/// range it covers, where the shadow blocks live, and how many bytes of the
/// last block are dead tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub op: u16,
    /// Bytes of the last covered block past the end of the write.
    pub last_block_residual: u16,
    pub virtual_idx: VirtualBlockIdx,
    pub logical_idx: LogicalBlockIdx,
    /// Bytes covered, counted from the start of the first block:
    /// `num_blocks * BLOCK_SIZE - last_block_residual`.
    pub size: u32,
}

impl LogEntry {
    pub fn num_blocks(&self) -> u32 {
        (self.size + BLOCK_SIZE as u32 - 1) >> BLOCK_SHIFT
    }

    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..2].copy_from_slice(&self.op.to_le_bytes());
        buf[2..4].copy_from_slice(&self.last_block_residual.to_le_bytes());
        buf[4..8].copy_from_slice(&self.virtual_idx.0.to_le_bytes());
        buf[8..12].copy_from_slice(&self.logical_idx.0.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn decode(buf: [u8; 16]) -> Result<LogEntry> {
        let entry = LogEntry {
            op: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            last_block_residual: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            virtual_idx: VirtualBlockIdx(u32::from_le_bytes(buf[4..8].try_into().unwrap())),
            logical_idx: LogicalBlockIdx(u32::from_le_bytes(buf[8..12].try_into().unwrap())),
            size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        };
        let valid = entry.op == LOG_OP_OVERWRITE
            && entry.logical_idx.0 != 0
            && entry.size != 0
            && usize::from(entry.last_block_residual) < BLOCK_SIZE
            && entry.num_blocks() <= 64;
        if !valid {
            return Err(Error::Corrupt {
                word: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            });
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_entry_encodings_are_nonzero_and_invert() {
        let begin = TxEntry::Begin {
            virtual_idx: VirtualBlockIdx(0),
            num_blocks: 1,
        };
        let inline = TxEntry::CommitInline {
            virtual_idx: VirtualBlockIdx(7),
            num_blocks: 63,
            logical_idx: LogicalBlockIdx(1),
        };
        let indirect = TxEntry::CommitIndirect {
            log_entry: LogEntryIdx {
                block: LogicalBlockIdx(0xdead_beef),
                local: 255,
            },
            begin_hint: 479,
        };
        for entry in [begin, inline, indirect] {
            let word = entry.encode();
            assert_ne!(word, 0);
            assert_eq!(TxEntry::decode(word).unwrap(), Some(entry));
        }
    }

    #[test]
    fn empty_slot_decodes_as_none() {
        assert_eq!(TxEntry::decode(0).unwrap(), None);
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        // non-zero word with no discriminator bit set
        assert!(TxEntry::decode(0x0000_0000_0000_0001).is_err());
        // inline commit pointing at the meta block
        let bad = TAG_INLINE | (1 << 57);
        assert!(TxEntry::decode(bad).is_err());
        // indirect commit with a zero log block
        assert!(TxEntry::decode(TAG_INDIRECT).is_err());
    }

    #[test]
    fn begin_hint_saturates() {
        let entry = TxEntry::CommitIndirect {
            log_entry: LogEntryIdx {
                block: LogicalBlockIdx(3),
                local: 0,
            },
            begin_hint: u32::MAX,
        };
        match TxEntry::decode(entry.encode()).unwrap().unwrap() {
            TxEntry::CommitIndirect { begin_hint, .. } => {
                assert_eq!(begin_hint, BEGIN_HINT_MAX)
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn log_entry_round_trips_and_counts_blocks() {
        let entry = LogEntry {
            op: LOG_OP_OVERWRITE,
            last_block_residual: 4092,
            virtual_idx: VirtualBlockIdx(0),
            logical_idx: LogicalBlockIdx(9),
            size: 4100,
        };
        assert_eq!(entry.num_blocks(), 2);
        assert_eq!(LogEntry::decode(entry.encode()).unwrap(), entry);
    }

    #[test]
    fn log_entry_rejects_garbage() {
        let mut buf = [0xffu8; 16];
        assert!(LogEntry::decode(buf).is_err());
        buf = LogEntry {
            op: LOG_OP_OVERWRITE,
            last_block_residual: 0,
            virtual_idx: VirtualBlockIdx(1),
            logical_idx: LogicalBlockIdx(0),
            size: 4096,
        }
        .encode();
        assert!(LogEntry::decode(buf).is_err());
    }
}
