//! XDR-style primitives over [`std::io`] readers and writers.
//!
//! Everything on the wire is big-endian and padded to four-byte cells:
//! 8- and 16-bit integers widen to a `u32`, strings and opaques carry
//! a `u32` length followed by zero padding (which readers verify),
//! collections a `u32` element count, optionals a boolean.

use std::io::{Read, Write};

use crate::{Error, Result};

pub trait XdrRead: Read {
    fn get_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).map_err(Error::from_read)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    fn get_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).map_err(Error::from_read)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }

    fn get_u8(&mut self) -> Result<u8> {
        let v = self.get_u32()?;
        u8::try_from(v).map_err(|_| Error::EncodingRange("u8 out of range"))
    }

    fn get_u16(&mut self) -> Result<u16> {
        let v = self.get_u32()?;
        u16::try_from(v).map_err(|_| Error::EncodingRange("u16 out of range"))
    }

    fn get_i16(&mut self) -> Result<i16> {
        let v = self.get_i32()?;
        i16::try_from(v).map_err(|_| Error::EncodingRange("i16 out of range"))
    }

    fn get_bool(&mut self) -> Result<bool> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::EncodingRange("bool out of range")),
        }
    }

    fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    fn get_opaque(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        let mut data = vec![0u8; len];
        self.read_exact(&mut data).map_err(Error::from_read)?;
        self.consume_padding(len)?;
        Ok(data)
    }

    fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_opaque()?;
        String::from_utf8(bytes).map_err(|_| Error::EncodingRange("string is not utf-8"))
    }

    fn consume_padding(&mut self, len: usize) -> Result<()> {
        let pad = (4 - len % 4) % 4;
        if pad != 0 {
            let mut buf = [0u8; 3];
            self.read_exact(&mut buf[..pad]).map_err(Error::from_read)?;
            if buf[..pad].iter().any(|&b| b != 0) {
                return Err(Error::BadPadding);
            }
        }
        Ok(())
    }

    fn get_collection<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>>
    where
        Self: Sized,
    {
        let n = self.get_u32()?;
        let mut out = Vec::with_capacity(n.min(4096) as usize);
        for _ in 0..n {
            out.push(f(self)?);
        }
        Ok(out)
    }

    /// Collection form that feeds an acceptor instead of building a
    /// vector.
    fn accept_collection<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T>,
        mut acceptor: impl FnMut(T),
    ) -> Result<()>
    where
        Self: Sized,
    {
        let n = self.get_u32()?;
        for _ in 0..n {
            acceptor(f(self)?);
        }
        Ok(())
    }

    fn get_optional<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<Option<T>>
    where
        Self: Sized,
    {
        if self.get_bool()? {
            Ok(Some(f(self)?))
        } else {
            Ok(None)
        }
    }
}

impl<R: Read> XdrRead for R {}

pub trait XdrWrite: Write {
    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn put_i32(&mut self, v: i32) -> Result<()> {
        self.put_u32(v as u32)
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn put_i64(&mut self, v: i64) -> Result<()> {
        self.put_u64(v as u64)
    }

    fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put_u32(v.into())
    }

    fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put_u32(v.into())
    }

    fn put_i16(&mut self, v: i16) -> Result<()> {
        self.put_i32(v.into())
    }

    fn put_bool(&mut self, v: bool) -> Result<()> {
        self.put_u32(v.into())
    }

    fn put_f64(&mut self, v: f64) -> Result<()> {
        self.put_u64(v.to_bits())
    }

    fn put_opaque(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::EncodingRange("opaque too long"))?;
        self.put_u32(len)?;
        self.write_all(data)?;
        let pad = (4 - data.len() % 4) % 4;
        self.write_all(&[0u8; 3][..pad])?;
        Ok(())
    }

    fn put_string(&mut self, s: &str) -> Result<()> {
        self.put_opaque(s.as_bytes())
    }

    fn put_collection<T>(
        &mut self,
        items: impl ExactSizeIterator<Item = T>,
        mut f: impl FnMut(&mut Self, T) -> Result<()>,
    ) -> Result<()>
    where
        Self: Sized,
    {
        let len =
            u32::try_from(items.len()).map_err(|_| Error::EncodingRange("collection too long"))?;
        self.put_u32(len)?;
        for item in items {
            f(self, item)?;
        }
        Ok(())
    }

    fn put_optional<T>(
        &mut self,
        value: Option<T>,
        f: impl FnOnce(&mut Self, T) -> Result<()>,
    ) -> Result<()>
    where
        Self: Sized,
    {
        match value {
            Some(v) => {
                self.put_bool(true)?;
                f(self, v)
            }
            None => self.put_bool(false),
        }
    }
}

impl<W: Write> XdrWrite for W {}

/// A fully buffered XDR payload, tracking whether it was consumed to
/// the end.
pub struct XdrCursor {
    inner: std::io::Cursor<Vec<u8>>,
}

impl XdrCursor {
    pub fn new(data: Vec<u8>) -> Self {
        XdrCursor {
            inner: std::io::Cursor::new(data),
        }
    }

    pub fn at_end(&self) -> bool {
        self.inner.position() >= self.inner.get_ref().len() as u64
    }

    /// Assert full consumption; decoding that leaves bytes behind has
    /// misparsed the segment.
    pub fn finish(self) -> Result<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(Error::DataRemaining)
        }
    }
}

impl Read for XdrCursor {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_widens_to_a_cell() {
        let mut buf = Vec::new();
        buf.put_u16(0xabcd).unwrap();
        assert_eq!(buf, [0, 0, 0xab, 0xcd]);
        assert_eq!((&buf[..]).get_u16().unwrap(), 0xabcd);
    }

    #[test]
    fn u16_range_checked_on_read() {
        let buf = [0, 1, 0, 0];
        assert!(matches!(
            (&buf[..]).get_u16(),
            Err(Error::EncodingRange(_))
        ));
    }

    #[test]
    fn string_pads_to_four_bytes() {
        let mut buf = Vec::new();
        buf.put_string("hello").unwrap();
        assert_eq!(buf, [0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o', 0, 0, 0]);
        assert_eq!((&buf[..]).get_string().unwrap(), "hello");
    }

    #[test]
    fn nonzero_string_padding_is_rejected() {
        let buf = [0, 0, 0, 1, b'x', 1, 0, 0];
        assert!(matches!((&buf[..]).get_string(), Err(Error::BadPadding)));
    }

    #[test]
    fn optional_roundtrip() {
        let mut buf = Vec::new();
        buf.put_optional(Some(7u32), |w, v| w.put_u32(v)).unwrap();
        buf.put_optional(None::<u32>, |w, v| w.put_u32(v)).unwrap();

        let mut r = &buf[..];
        assert_eq!(r.get_optional(|r| r.get_u32()).unwrap(), Some(7));
        assert_eq!(r.get_optional(|r| r.get_u32()).unwrap(), None);
    }

    #[test]
    fn collection_roundtrip() {
        let mut buf = Vec::new();
        buf.put_collection([1u32, 2, 3].into_iter(), |w, v| w.put_u32(v))
            .unwrap();
        let got = (&buf[..]).get_collection(|r| r.get_u32()).unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn short_read_is_end_of_stream() {
        let buf = [0u8, 0];
        assert!(matches!((&buf[..]).get_u32(), Err(Error::EndOfStream)));
    }

    #[test]
    fn negative_i64_roundtrip() {
        let mut buf = Vec::new();
        buf.put_i64(-123456789).unwrap();
        assert_eq!((&buf[..]).get_i64().unwrap(), -123456789);
    }
}
