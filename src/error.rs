use std::io;

use thiserror::Error;

use crate::idx::LogicalBlockIdx;

/// Failures surfaced by the storage core. The POSIX shim is expected to
/// translate these to errno values; inside the crate they propagate with `?`.
#[derive(Debug, Error)]
pub enum Error {
    /// The shared bitmap has no free run left that satisfies the request.
    #[error("no free blocks left in the allocation bitmap")]
    NoSpace,

    /// A seek produced a negative file offset.
    #[error("resulting file offset is negative")]
    InvalidOffset,

    /// A logical block lies beyond the mapped extent. Callers recover by
    /// remapping and retrying; user code should never observe this.
    #[error("logical block {0} is beyond the mapped extent")]
    OutOfRange(LogicalBlockIdx),

    /// A persistent entry decodes inconsistently. Iteration of the tx
    /// history stops at the bad entry, which truncates the visible state.
    #[error("corrupt persistent entry {word:#018x}")]
    Corrupt { word: u64 },

    /// The underlying open/ftruncate/mmap failed; fatal for the file.
    #[error("io failure: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
