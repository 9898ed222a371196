//! Versioned on-disk time-series format, version 2.
//!
//! A v2 file is a mime header plus a tsfile header, followed by
//! CRC-protected *segments* — length-addressed extents holding XDR
//! payloads, optionally compressed. Two layouts share this framing:
//!
//! - **list** files are an append log of records, newest first, each
//!   pointing at its predecessor, its (optional) dictionary delta and
//!   its measurements;
//! - **tables** files hold columnar blocks: per block a timestamp
//!   vector, a dictionary and a two-level table structure
//!   (`(group, tags)` → group table → per-metric column).
//!
//! Strings, paths and tag sets are dictionary-encoded ([`dictionary`]);
//! decoded objects are shared through a size- and age-bounded
//! [`cache::DecodeCache`].

pub mod bitset;
pub mod cache;
mod ctx;
pub mod dictionary;
mod error;
mod list;
mod record;
mod segment;
mod tables;
mod tables_file;
mod timestamp_delta;
mod tsfile;
pub mod xdr;

pub use ctx::{Compression, EncdecCtx, SegmentAppender};
pub use error::Error;
pub use list::TsdataList;
pub use record::{decode_metric_value, encode_metric_value, ListRecord};
pub use segment::{FileSegmentPtr, SegmentReader, SegmentWriter};
pub use tables::{GroupTable, MetricTable, Tables, TablesBlock};
pub use tables_file::{EmitEntry, TsdataTables};
pub use timestamp_delta::{decode_timestamp_delta, encode_timestamp_delta};
pub use tsfile::{
    FileKind, Flags, MimeHeader, Tsdata, TsfileHeader, MAJOR_VERSION, MINOR_VERSION,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;
