use std::fs::File;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use log::trace;

use crate::segment::{FileSegmentPtr, SegmentReader, SegmentWriter};
use crate::tsfile::Flags;
use crate::xdr::XdrCursor;
use crate::{Error, Result};

/// Segment compression, from the header flags.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    None,
    Lzo1x1,
    Gzip,
    Snappy,
}

impl Compression {
    pub fn from_flags(flags: Flags) -> Result<Self> {
        let c = flags & Flags::COMPRESSION_MASK;
        if c.is_empty() {
            Ok(Compression::None)
        } else if c == Flags::LZO_1X1 {
            Ok(Compression::Lzo1x1)
        } else if c == Flags::GZIP {
            Ok(Compression::Gzip)
        } else if c == Flags::SNAPPY {
            Ok(Compression::Snappy)
        } else {
            Err(Error::UnsupportedCompression(c.bits()))
        }
    }
}

/// Shared decode/encode context of one open file: its descriptor and
/// header flags.
///
/// Cheap to clone; every nested structure keeps one to reach the file.
#[derive(Clone)]
pub struct EncdecCtx {
    fd: Arc<File>,
    flags: Flags,
}

impl EncdecCtx {
    pub fn new(fd: Arc<File>, flags: Flags) -> Self {
        EncdecCtx { fd, flags }
    }

    pub fn fd(&self) -> &Arc<File> {
        &self.fd
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn compression(&self) -> Result<Compression> {
        Compression::from_flags(self.flags)
    }

    /// Open a segment for reading: verify its CRC, undo compression
    /// when `compressed` (header payloads are stored raw), and hand
    /// back a fully buffered XDR cursor.
    pub fn new_reader(&self, ptr: FileSegmentPtr, compressed: bool) -> Result<XdrCursor> {
        let raw = SegmentReader::new(self.fd.as_ref(), ptr.offset(), ptr.len()).read_all()?;
        let payload = if compressed {
            self.decompress(raw)?
        } else {
            raw
        };
        Ok(XdrCursor::new(payload))
    }

    fn decompress(&self, raw: Vec<u8>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self.compression()? {
            Compression::None => return Ok(raw),
            Compression::Gzip => {
                GzDecoder::new(&raw[..])
                    .read_to_end(&mut out)
                    .map_err(Error::from_read)?;
            }
            Compression::Snappy => {
                snap::read::FrameDecoder::new(&raw[..])
                    .read_to_end(&mut out)
                    .map_err(Error::from_read)?;
            }
            Compression::Lzo1x1 => {
                return Err(Error::UnsupportedCompression(
                    (self.flags & Flags::COMPRESSION_MASK).bits(),
                ))
            }
        }
        Ok(out)
    }

    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.compression()? {
            Compression::None => Ok(payload.to_vec()),
            Compression::Gzip => {
                let mut enc = GzEncoder::new(Vec::new(), GzLevel::default());
                enc.write_all(payload)?;
                Ok(enc.finish()?)
            }
            Compression::Snappy => {
                let mut enc = snap::write::FrameEncoder::new(Vec::new());
                enc.write_all(payload)?;
                enc.into_inner()
                    .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
            }
            Compression::Lzo1x1 => Err(Error::UnsupportedCompression(
                (self.flags & Flags::COMPRESSION_MASK).bits(),
            )),
        }
    }

    /// Start appending segments at `offset`.
    pub fn appender(&self, offset: u64) -> SegmentAppender {
        SegmentAppender {
            ctx: self.clone(),
            off: offset,
        }
    }
}

/// Writes a run of consecutive segments, handing back a pointer for
/// each.
pub struct SegmentAppender {
    ctx: EncdecCtx,
    off: u64,
}

impl SegmentAppender {
    /// Frame `payload` (compressing it first unless `raw`) as the next
    /// segment.
    pub fn put_segment(&mut self, payload: &[u8], raw: bool) -> Result<FileSegmentPtr> {
        let compressed;
        let stored: &[u8] = if raw {
            payload
        } else {
            compressed = self.ctx.compress(payload)?;
            &compressed
        };

        let mut writer = SegmentWriter::new(self.ctx.fd.as_ref(), self.off);
        writer.write_all(stored)?;
        let (data_len, storage_len) = writer.close()?;

        let ptr = FileSegmentPtr::new(self.off, data_len);
        trace!(
            "segment at {}+{} ({} bytes stored)",
            ptr.offset(),
            ptr.len(),
            storage_len,
        );
        self.off += storage_len;
        Ok(ptr)
    }

    /// Offset right past the last segment written.
    pub fn position(&self) -> u64 {
        self.off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(flags: Flags) -> EncdecCtx {
        EncdecCtx::new(Arc::new(tempfile::tempfile().unwrap()), flags)
    }

    #[test]
    fn raw_segment_roundtrip() {
        let ctx = ctx(Flags::KIND_TABLES);
        let mut app = ctx.appender(64);
        let ptr = app.put_segment(b"some payload", false).unwrap();

        let mut r = ctx.new_reader(ptr, true).unwrap();
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"some payload");
    }

    #[test]
    fn gzip_segment_roundtrip() {
        let ctx = ctx(Flags::GZIP);
        let payload = vec![7u8; 4096];
        let mut app = ctx.appender(64);
        let ptr = app.put_segment(&payload, false).unwrap();
        // Compressible payload actually shrinks on disk.
        assert!(ptr.len() < 4096);

        let mut r = ctx.new_reader(ptr, true).unwrap();
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn snappy_segment_roundtrip() {
        let ctx = ctx(Flags::SNAPPY);
        let payload: Vec<u8> = (0..1024u32).flat_map(|v| (v % 50).to_be_bytes()).collect();
        let mut app = ctx.appender(64);
        let ptr = app.put_segment(&payload, false).unwrap();

        let mut r = ctx.new_reader(ptr, true).unwrap();
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn lzo_is_reported_unsupported() {
        let ctx = ctx(Flags::LZO_1X1);
        let mut app = ctx.appender(64);
        assert!(matches!(
            app.put_segment(b"x", false),
            Err(Error::UnsupportedCompression(_))
        ));
    }

    #[test]
    fn appender_advances_past_framing() {
        let ctx = ctx(Flags::KIND_LIST);
        let mut app = ctx.appender(100);
        let a = app.put_segment(b"abcde", false).unwrap();
        let b = app.put_segment(b"xyz", false).unwrap();
        assert_eq!(a.offset(), 100);
        // 5 bytes payload + 3 pad + 4 crc.
        assert_eq!(b.offset(), 112);
        assert_eq!(app.position(), b.offset() + b.storage_len());
    }
}
