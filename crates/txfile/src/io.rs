//! Positional file I/O.
//!
//! All file access in this crate goes through offsets rather than a
//! shared cursor, so concurrent readers never contend on seek state.

use std::fs::File;
use std::io;

#[cfg(target_family = "unix")]
use std::os::unix::fs::FileExt;
#[cfg(target_family = "windows")]
use std::os::windows::fs::FileExt;

/// Read at an absolute offset. A return of 0 means end-of-file.
pub trait ReadAt {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Read exactly `buf.len()` bytes starting at `off`.
    fn read_exact_at(&self, mut off: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(off, buf)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ))
                }
                n => {
                    off += n as u64;
                    buf = &mut buf[n..];
                }
            }
        }
        Ok(())
    }
}

/// Write at an absolute offset.
pub trait WriteAt {
    fn write_at(&self, off: u64, buf: &[u8]) -> io::Result<usize>;

    fn write_all_at(&self, mut off: u64, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_at(off, buf)? {
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write whole buffer",
                    ))
                }
                n => {
                    off += n as u64;
                    buf = &buf[n..];
                }
            }
        }
        Ok(())
    }
}

impl ReadAt for File {
    #[cfg(target_family = "unix")]
    fn read_at(&self, off: u64, buf: &mut [u8]) -> io::Result<usize> {
        FileExt::read_at(self, buf, off)
    }

    #[cfg(target_family = "windows")]
    fn read_at(&self, off: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek_read(buf, off)
    }
}

impl WriteAt for File {
    #[cfg(target_family = "unix")]
    fn write_at(&self, off: u64, buf: &[u8]) -> io::Result<usize> {
        FileExt::write_at(self, buf, off)
    }

    #[cfg(target_family = "windows")]
    fn write_at(&self, off: u64, buf: &[u8]) -> io::Result<usize> {
        self.seek_write(buf, off)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(off, buf)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for std::sync::Arc<T> {
    fn read_at(&self, off: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(off, buf)
    }
}
