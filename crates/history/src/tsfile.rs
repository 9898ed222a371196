use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;

use bitflags::bitflags;
use monsoon_model::{TimePoint, TimeSeries};

use crate::list::TsdataList;
use crate::segment::{FileSegmentPtr, SegmentReader, SegmentWriter};
use crate::tables_file::TsdataTables;
use crate::xdr::{XdrCursor, XdrRead, XdrWrite};
use crate::{Error, Result};

pub const MAJOR_VERSION: u16 = 2;
pub const MINOR_VERSION: u16 = 0;

/// The twelve magic bytes opening every tsdata file.
pub const MAGIC: [u8; 12] = [
    0x11, 0x13, 0x17, 0x1d, b'M', b'O', b'N', b'-', b's', b'o', b'o', b'n',
];

/// Payload length of mime header plus tsfile header.
pub(crate) const HEADER_LEN: u64 = 16 + 48;
/// The header segment on disk, checksum included.
pub(crate) const HEADER_STORAGE_LEN: u64 = HEADER_LEN + 4;

bitflags! {
    /// The tsfile header flags word.
    ///
    /// The low nibble selects the file kind (`0` = list, `1` =
    /// tables); bits 24–29 the segment compression; the top two bits
    /// record whether timestamps are sorted and distinct across the
    /// whole file.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Flags: u32 {
        const KIND_LIST = 0x0000_0000;
        const KIND_TABLES = 0x0000_0001;
        const KIND_MASK = 0x0000_000f;
        const LZO_1X1 = 0x1000_0000;
        const GZIP = 0x2000_0000;
        const SNAPPY = 0x3000_0000;
        const COMPRESSION_MASK = 0x3f00_0000;
        const SORTED = 0x4000_0000;
        const DISTINCT = 0x8000_0000;
    }
}

/// File kind from the flags nibble. `KIND_LIST` is the all-zero
/// nibble.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    List,
    Tables,
}

impl Flags {
    pub fn kind(self) -> Result<FileKind> {
        let nibble = self & Flags::KIND_MASK;
        if nibble.is_empty() {
            Ok(FileKind::List)
        } else if nibble == Flags::KIND_TABLES {
            Ok(FileKind::Tables)
        } else {
            Err(Error::EncodingRange("file kind not recognized"))
        }
    }

    pub fn is_sorted(self) -> bool {
        self.contains(Flags::SORTED)
    }

    pub fn is_distinct(self) -> bool {
        self.contains(Flags::DISTINCT)
    }
}

/// The mime header: magic plus a major/minor version pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MimeHeader {
    pub major: u16,
    pub minor: u16,
}

impl MimeHeader {
    pub fn current() -> Self {
        MimeHeader {
            major: MAJOR_VERSION,
            minor: MINOR_VERSION,
        }
    }

    pub fn decode(reader: &mut impl XdrRead) -> Result<Self> {
        let mut magic = [0u8; 12];
        reader.read_exact(&mut magic).map_err(Error::from_read)?;
        if magic != MAGIC {
            return Err(Error::BadMagic);
        }
        let version = reader.get_u32()?;
        let hdr = MimeHeader {
            major: (version >> 16) as u16,
            minor: version as u16,
        };
        if hdr.major > MAJOR_VERSION {
            return Err(Error::UnsupportedVersion {
                major: hdr.major,
                minor: hdr.minor,
            });
        }
        Ok(hdr)
    }

    pub fn encode(&self, writer: &mut impl XdrWrite) -> Result<()> {
        writer.write_all(&MAGIC)?;
        writer.put_u32(u32::from(self.major) << 16 | u32::from(self.minor))
    }
}

/// The fixed-size header after the mime header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TsfileHeader {
    pub first: TimePoint,
    pub last: TimePoint,
    pub flags: Flags,
    pub reserved: u32,
    pub file_size: u64,
    pub fdt: FileSegmentPtr,
}

impl TsfileHeader {
    pub fn decode(reader: &mut impl XdrRead) -> Result<Self> {
        Ok(TsfileHeader {
            first: TimePoint::from_millis(reader.get_i64()?),
            last: TimePoint::from_millis(reader.get_i64()?),
            flags: Flags::from_bits_retain(reader.get_u32()?),
            reserved: reader.get_u32()?,
            file_size: reader.get_u64()?,
            fdt: FileSegmentPtr::decode(reader)?,
        })
    }

    pub fn encode(&self, writer: &mut impl XdrWrite) -> Result<()> {
        writer.put_i64(self.first.millis_since_epoch())?;
        writer.put_i64(self.last.millis_since_epoch())?;
        writer.put_u32(self.flags.bits())?;
        writer.put_u32(self.reserved)?;
        writer.put_u64(self.file_size)?;
        self.fdt.encode(writer)
    }
}

/// Rewrite the CRC-framed header segment at offset 0 and flush.
pub(crate) fn write_header(fd: &File, mime: &MimeHeader, hdr: &TsfileHeader) -> Result<()> {
    let mut payload = Vec::with_capacity(HEADER_LEN as usize);
    mime.encode(&mut payload)?;
    hdr.encode(&mut payload)?;
    debug_assert_eq!(payload.len() as u64, HEADER_LEN);

    let mut writer = SegmentWriter::new(fd, 0);
    std::io::Write::write_all(&mut writer, &payload)?;
    let (data_len, storage_len) = writer.close()?;
    debug_assert_eq!(data_len, HEADER_LEN);
    debug_assert_eq!(storage_len, HEADER_STORAGE_LEN);

    fd.sync_data()?;
    Ok(())
}

pub(crate) fn read_header(fd: &File) -> Result<(MimeHeader, TsfileHeader)> {
    let payload = SegmentReader::new(fd, 0, HEADER_LEN).read_all()?;
    let mut cursor = XdrCursor::new(payload);
    let mime = MimeHeader::decode(&mut cursor)?;
    let hdr = TsfileHeader::decode(&mut cursor)?;
    cursor.finish()?;
    Ok((mime, hdr))
}

/// An open v2 time-series file of either kind.
pub enum Tsdata {
    List(TsdataList),
    Tables(TsdataTables),
}

impl Tsdata {
    /// Open an existing file, validating magic, version and header
    /// checksum before exposing anything.
    pub fn open(file: File) -> Result<Self> {
        let fd = Arc::new(file);
        let (mime, hdr) = read_header(&fd)?;
        match hdr.flags.kind()? {
            FileKind::List => Ok(Tsdata::List(TsdataList::new(fd, mime, hdr))),
            FileKind::Tables => Ok(Tsdata::Tables(TsdataTables::new(fd, mime, hdr))),
        }
    }

    /// Create an empty list file whose time range starts out at `tp`.
    pub fn new_list_file(file: File, tp: TimePoint) -> Result<Self> {
        let mime = MimeHeader::current();
        let hdr = TsfileHeader {
            first: tp,
            last: tp,
            // An empty file is trivially sorted and distinct.
            flags: Flags::GZIP | Flags::SORTED | Flags::DISTINCT,
            reserved: 0,
            file_size: HEADER_STORAGE_LEN,
            fdt: FileSegmentPtr::null(),
        };
        write_header(&file, &mime, &hdr)?;
        Self::open(file)
    }

    pub fn version(&self) -> (u16, u16) {
        let mime = match self {
            Tsdata::List(l) => l.mime(),
            Tsdata::Tables(t) => t.mime(),
        };
        (mime.major, mime.minor)
    }

    pub fn time(&self) -> (TimePoint, TimePoint) {
        let hdr = self.header();
        (hdr.first, hdr.last)
    }

    pub fn is_sorted(&self) -> bool {
        self.header().flags.is_sorted()
    }

    pub fn is_distinct(&self) -> bool {
        self.header().flags.is_distinct()
    }

    fn header(&self) -> TsfileHeader {
        match self {
            Tsdata::List(l) => l.header(),
            Tsdata::Tables(t) => t.header(),
        }
    }

    /// Append one time series. Only list files are writable.
    pub fn push_back(&mut self, ts: &TimeSeries) -> Result<()> {
        match self {
            Tsdata::List(l) => l.push_back(ts),
            Tsdata::Tables(_) => Err(Error::Unsupported("push_back on a tables file")),
        }
    }

    /// Read every time series in the file.
    ///
    /// Unless the SORTED flag holds, the result is (stably) sorted by
    /// timestamp; unless DISTINCT holds, entries at equal timestamps
    /// are merged, later records winning per metric.
    pub fn read_all(&self) -> Result<Vec<TimeSeries>> {
        let mut result = match self {
            Tsdata::List(l) => l.read_all_raw()?,
            Tsdata::Tables(t) => t.read_all_raw()?,
        };

        if !self.is_sorted() {
            result.sort_by_key(|ts| ts.time());
        }

        if !self.is_distinct() {
            let mut merged: Vec<TimeSeries> = Vec::with_capacity(result.len());
            for ts in result {
                match merged.last_mut() {
                    Some(last) if last.time() == ts.time() => last.merge(ts),
                    _ => merged.push(ts),
                }
            }
            result = merged;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monsoon_txfile::io::WriteAt;

    #[test]
    fn flags_fixture_values() {
        assert_eq!(Flags::KIND_MASK.bits(), 0x0000_000f);
        assert_eq!(Flags::COMPRESSION_MASK.bits(), 0x3f00_0000);
        assert_eq!(Flags::LZO_1X1.bits(), 0x1000_0000);
        assert_eq!(Flags::GZIP.bits(), 0x2000_0000);
        assert_eq!(Flags::SNAPPY.bits(), 0x3000_0000);
        assert_eq!(Flags::SORTED.bits(), 0x4000_0000);
        assert_eq!(Flags::DISTINCT.bits(), 0x8000_0000);
    }

    #[test]
    fn kind_dispatch() {
        assert_eq!(Flags::GZIP.kind().unwrap(), FileKind::List);
        assert_eq!(
            (Flags::GZIP | Flags::KIND_TABLES).kind().unwrap(),
            FileKind::Tables,
        );
        assert!(Flags::from_bits_retain(0x7).kind().is_err());
    }

    #[test]
    fn header_roundtrip() {
        let mime = MimeHeader::current();
        let hdr = TsfileHeader {
            first: TimePoint::from_millis(100),
            last: TimePoint::from_millis(900),
            flags: Flags::GZIP | Flags::SORTED,
            reserved: 0,
            file_size: 4096,
            fdt: FileSegmentPtr::new(68, 52),
        };

        let file = tempfile::tempfile().unwrap();
        write_header(&file, &mime, &hdr).unwrap();
        let (mime2, hdr2) = read_header(&file).unwrap();
        assert_eq!(mime2, mime);
        assert_eq!(hdr2, hdr);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let file = tempfile::tempfile().unwrap();
        write_header(
            &file,
            &MimeHeader::current(),
            &TsfileHeader {
                first: TimePoint::from_millis(0),
                last: TimePoint::from_millis(0),
                flags: Flags::empty(),
                reserved: 0,
                file_size: HEADER_STORAGE_LEN,
                fdt: FileSegmentPtr::null(),
            },
        )
        .unwrap();

        // Clobber the magic and fix up nothing else: the CRC fails
        // before the magic is even looked at.
        file.write_all_at(0, b"nope").unwrap();
        assert!(matches!(
            Tsdata::open(file),
            Err(Error::CrcMismatch | Error::BadMagic)
        ));
    }

    #[test]
    fn future_major_version_is_rejected() {
        let mut payload = Vec::new();
        MimeHeader {
            major: MAJOR_VERSION + 1,
            minor: 0,
        }
        .encode(&mut payload)
        .unwrap();

        assert!(matches!(
            MimeHeader::decode(&mut &payload[..]),
            Err(Error::UnsupportedVersion { .. })
        ));
    }
}
