use std::fmt;

/// Index of a block within the underlying file. The meta block is always
/// logical block 0, so 0 doubles as "unallocated" in the block table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LogicalBlockIdx(pub u32);

/// Index of a block as seen by the application, i.e. `offset >> BLOCK_SHIFT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtualBlockIdx(pub u32);

impl fmt::Display for LogicalBlockIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VirtualBlockIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position in the transaction stream. Block 0 addresses the meta block's
/// inline entry region; any other block is a chained tx block. `local` may
/// sit one past the arena end, in which case the cursor must be pushed into
/// the next chained block before it can be dereferenced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxCursor {
    pub block: LogicalBlockIdx,
    pub local: u32,
}

impl TxCursor {
    /// Pack into one word so a cursor can be published with a single
    /// atomic store.
    pub(crate) fn to_word(self) -> u64 {
        (u64::from(self.block.0) << 32) | u64::from(self.local)
    }

    pub(crate) fn from_word(word: u64) -> TxCursor {
        TxCursor {
            block: LogicalBlockIdx((word >> 32) as u32),
            local: word as u32,
        }
    }

    /// The slot immediately after this one in the same arena. Callers rely
    /// on overflow handling to push the result into the next block.
    pub(crate) fn successor(self) -> TxCursor {
        TxCursor {
            block: self.block,
            local: self.local + 1,
        }
    }
}

impl fmt::Display for TxCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.local)
    }
}

/// Identifies a 16-byte log entry: the log block and the slot within it.
/// On the wire this packs into 40 bits inside an indirect commit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntryIdx {
    pub block: LogicalBlockIdx,
    pub local: u8,
}

impl fmt::Display for LogEntryIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.block, self.local)
    }
}
