//! CRC-protected extents ("segments") and the pointer type addressing
//! them.
//!
//! A segment stores its payload, zero padding up to a four-byte
//! boundary, and a big-endian CRC32 over payload plus padding. The
//! declared length of a segment is its payload length; the padding and
//! checksum are framing.

use std::io::{Read, Write};

use monsoon_txfile::io::{ReadAt, WriteAt};

use crate::xdr::{XdrRead, XdrWrite};
use crate::{Error, Result};

/// `(offset, length)` handle addressing a segment in the file.
///
/// The null pointer `(0, 0)` marks an absent segment; offset 0 always
/// holds the file header, never a payload segment.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct FileSegmentPtr {
    off: u64,
    len: u64,
}

impl FileSegmentPtr {
    pub const fn new(off: u64, len: u64) -> Self {
        FileSegmentPtr { off, len }
    }

    pub const fn null() -> Self {
        FileSegmentPtr { off: 0, len: 0 }
    }

    pub const fn offset(self) -> u64 {
        self.off
    }

    pub const fn len(self) -> u64 {
        self.len
    }

    pub const fn is_null(self) -> bool {
        self.off == 0
    }

    /// Bytes the segment occupies on disk: payload, padding, CRC.
    pub const fn storage_len(self) -> u64 {
        self.len + (4 - self.len % 4) % 4 + 4
    }

    pub fn decode(reader: &mut impl XdrRead) -> Result<Self> {
        let off = reader.get_u64()?;
        let len = reader.get_u64()?;
        Ok(FileSegmentPtr { off, len })
    }

    pub fn encode(self, writer: &mut impl XdrWrite) -> Result<()> {
        writer.put_u64(self.off)?;
        writer.put_u64(self.len)
    }
}

/// Streams a payload into the file at a fixed offset, then closes the
/// frame with padding and checksum.
pub struct SegmentWriter<'a, F: WriteAt> {
    file: &'a F,
    begin: u64,
    written: u64,
    crc: crc32fast::Hasher,
}

impl<'a, F: WriteAt> SegmentWriter<'a, F> {
    pub fn new(file: &'a F, offset: u64) -> Self {
        SegmentWriter {
            file,
            begin: offset,
            written: 0,
            crc: crc32fast::Hasher::new(),
        }
    }

    /// Write padding and checksum.
    ///
    /// Returns `(data_len, storage_len)`: the payload length and the
    /// total bytes occupied on disk.
    pub fn close(mut self) -> Result<(u64, u64)> {
        let pad = ((4 - self.written % 4) % 4) as usize;
        if pad != 0 {
            let zeroes = [0u8; 3];
            self.crc.update(&zeroes[..pad]);
            self.file
                .write_all_at(self.begin + self.written, &zeroes[..pad])?;
        }
        let crc = self.crc.finalize();
        self.file
            .write_all_at(self.begin + self.written + pad as u64, &crc.to_be_bytes())?;
        Ok((self.written, self.written + pad as u64 + 4))
    }
}

impl<F: WriteAt> Write for SegmentWriter<'_, F> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.file.write_at(self.begin + self.written, buf)?;
        self.crc.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Reads a segment of a declared length, verifying padding and
/// checksum on close.
pub struct SegmentReader<'a, F: ReadAt> {
    file: &'a F,
    at: u64,
    avail: u64,
    payload_len: u64,
    crc: crc32fast::Hasher,
}

impl<'a, F: ReadAt> SegmentReader<'a, F> {
    pub fn new(file: &'a F, offset: u64, len: u64) -> Self {
        SegmentReader {
            file,
            at: offset,
            avail: len,
            payload_len: len,
            crc: crc32fast::Hasher::new(),
        }
    }

    pub fn at_end(&self) -> bool {
        self.avail == 0
    }

    /// Read the whole payload and verify the frame.
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; self.avail as usize];
        let mut at = 0;
        while at < payload.len() {
            let n = self.read(&mut payload[at..]).map_err(Error::from_read)?;
            at += n;
        }
        self.close()?;
        Ok(payload)
    }

    /// Consume padding, then compare the stored CRC against the
    /// running one. The payload must have been fully read.
    pub fn close(mut self) -> Result<()> {
        if self.avail != 0 {
            return Err(Error::EndOfStream);
        }

        let pad = ((4 - self.payload_len % 4) % 4) as usize;
        if pad != 0 {
            let mut buf = [0u8; 3];
            self.file
                .read_exact_at(self.at, &mut buf[..pad])
                .map_err(Error::from_read)?;
            if buf[..pad].iter().any(|&b| b != 0) {
                return Err(Error::BadPadding);
            }
            self.crc.update(&buf[..pad]);
            self.at += pad as u64;
        }

        let mut stored = [0u8; 4];
        self.file
            .read_exact_at(self.at, &mut stored)
            .map_err(Error::from_read)?;
        if self.crc.clone().finalize() != u32::from_be_bytes(stored) {
            return Err(Error::CrcMismatch);
        }
        Ok(())
    }
}

impl<F: ReadAt> Read for SegmentReader<'_, F> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.avail == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.avail) as usize;
        let n = self.file.read_at(self.at, &mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "segment ends before its declared length",
            ));
        }
        self.crc.update(&buf[..n]);
        self.at += n as u64;
        self.avail -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn tmpfile() -> File {
        tempfile::tempfile().unwrap()
    }

    fn write_segment(file: &File, off: u64, payload: &[u8]) -> (u64, u64) {
        let mut w = SegmentWriter::new(file, off);
        w.write_all(payload).unwrap();
        w.close().unwrap()
    }

    #[test]
    fn roundtrip_with_padding() {
        let file = tmpfile();
        let (dlen, slen) = write_segment(&file, 0, b"hello");
        assert_eq!(dlen, 5);
        assert_eq!(slen, 5 + 3 + 4);

        let got = SegmentReader::new(&file, 0, dlen).read_all().unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn roundtrip_aligned_payload() {
        let file = tmpfile();
        let (dlen, slen) = write_segment(&file, 16, b"12345678");
        assert_eq!((dlen, slen), (8, 12));

        let got = SegmentReader::new(&file, 16, 8).read_all().unwrap();
        assert_eq!(got, b"12345678");
    }

    #[test]
    fn corrupt_payload_fails_crc() {
        let file = tmpfile();
        let (dlen, _) = write_segment(&file, 0, b"hello world");
        file.write_all_at(3, b"X").unwrap();

        assert!(matches!(
            SegmentReader::new(&file, 0, dlen).read_all(),
            Err(Error::CrcMismatch)
        ));
    }

    #[test]
    fn nonzero_padding_is_rejected() {
        let file = tmpfile();
        let (dlen, _) = write_segment(&file, 0, b"hello");
        // Byte 5 is the first padding byte.
        file.write_all_at(5, &[1]).unwrap();

        assert!(matches!(
            SegmentReader::new(&file, 0, dlen).read_all(),
            Err(Error::BadPadding)
        ));
    }

    #[test]
    fn truncated_segment_is_end_of_stream() {
        let file = tmpfile();
        file.write_all_at(0, b"ab").unwrap();
        // Declared length exceeds what the file holds.
        assert!(matches!(
            SegmentReader::new(&file, 0, 100).read_all(),
            Err(Error::EndOfStream)
        ));
    }

    #[test]
    fn ptr_xdr_roundtrip() {
        let mut buf = Vec::new();
        FileSegmentPtr::new(0x1122, 0x3344).encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 16);
        let got = FileSegmentPtr::decode(&mut &buf[..]).unwrap();
        assert_eq!(got, FileSegmentPtr::new(0x1122, 0x3344));
        assert!(FileSegmentPtr::null().is_null());
    }
}
