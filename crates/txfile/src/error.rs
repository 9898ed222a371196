use std::io;

use thiserror::Error;

/// Errors of the transactional file substrate.
#[derive(Debug, Error)]
pub enum Error {
    /// No room in the WAL for a record, or no free transaction id.
    #[error("WAL allocation failed: {0}")]
    WalBadAlloc(&'static str),

    /// A WAL segment contains a record that cannot be parsed.
    #[error("unrecognized WAL entry")]
    BadWalEntry,

    /// Magic bytes of a persisted structure do not match.
    #[error("bad magic")]
    BadMagic,

    /// A write addressed bytes past the end of the (transaction-local)
    /// file size.
    #[error("write past end of file: offset={offset} len={len} size={size}")]
    WritePastEof { offset: u64, len: u64, size: u64 },

    /// The commit-manager validation predicate rejected the commit.
    #[error("transaction conflict: {0}")]
    TxConflict(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
