use std::io;

use thiserror::Error;

/// Errors of the v2 history format.
#[derive(Debug, Error)]
pub enum Error {
    /// Magic bytes or version of the file do not match. Fatal for the
    /// file.
    #[error("bad magic")]
    BadMagic,

    /// The file was written by a newer major version.
    #[error("unsupported file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    /// Nonzero bytes where a segment requires zero padding. Fatal for
    /// the file.
    #[error("non-zero bytes in padding")]
    BadPadding,

    /// A segment checksum failed. Fatal for the extent.
    #[error("CRC mismatch")]
    CrcMismatch,

    /// A segment ended before its declared length. Fatal for the
    /// extent.
    #[error("end of stream")]
    EndOfStream,

    /// A segment decoded cleanly but left trailing bytes.
    #[error("xdr data remaining")]
    DataRemaining,

    /// A value does not fit its wire representation: timestamp delta
    /// beyond 32 bits, out-of-range small int, dictionary overflow.
    #[error("encoding range: {0}")]
    EncodingRange(&'static str),

    /// A dictionary index was out of range.
    #[error("dictionary lookup: index {0} not present")]
    DictionaryLookup(u32),

    /// A dictionary delta did not continue where the dictionary ends.
    #[error("dictionary updates must be contiguous")]
    BadDictionaryUpdate,

    /// The file uses a compression this build cannot decode.
    #[error("unsupported compression (flags {0:#x})")]
    UnsupportedCompression(u32),

    /// The operation is not supported by this file kind.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Map the `UnexpectedEof` of an inner reader onto the segment
    /// taxonomy.
    pub(crate) fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::EndOfStream
        } else {
            Error::Io(err)
        }
    }
}
