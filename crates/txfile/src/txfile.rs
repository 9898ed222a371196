use std::fs::File;
use std::sync::Arc;

use crate::wal::WalRegion;
use crate::{Error, ReplacementMap, Result};

/// A file exposing read and write transactions.
///
/// Thin wrapper over a [`WalRegion`]: the WAL occupies
/// `[wal_off, wal_off + wal_len)` of the underlying file, and the
/// transactional byte store the callers see is the data region after
/// it, addressed from logical offset 0.
///
/// Cloning a `Txfile` is cheap and yields a handle onto the same file.
#[derive(Clone)]
pub struct Txfile {
    wal: Arc<WalRegion>,
}

impl Txfile {
    /// Create a new txfile, initializing a WAL region of `wal_len`
    /// bytes at `wal_off`. The logical file starts out empty.
    pub fn create(file: File, wal_off: u64, wal_len: u64) -> Result<Self> {
        Ok(Txfile {
            wal: Arc::new(WalRegion::create(file, wal_off, wal_len)?),
        })
    }

    /// Open an existing txfile, running WAL recovery if `writable`.
    pub fn open(file: File, wal_off: u64, wal_len: u64, writable: bool) -> Result<Self> {
        Ok(Txfile {
            wal: Arc::new(WalRegion::open(file, wal_off, wal_len, writable)?),
        })
    }

    /// Begin a transaction.
    ///
    /// A read-only transaction is a snapshot-free view of the current
    /// logical file; it allocates nothing. A read-write transaction
    /// holds a private replacement map and a WAL transaction id.
    pub fn begin(&self, read_only: bool) -> Result<Transaction> {
        let tx_id = if read_only {
            None
        } else {
            Some(self.wal.allocate_tx_id()?)
        };
        Ok(Transaction {
            wal: Arc::clone(&self.wal),
            tx_id,
            writes: ReplacementMap::new(),
            new_file_size: None,
        })
    }

    /// Logical size of the file.
    pub fn size(&self) -> u64 {
        self.wal.size()
    }

    /// Replay the WAL into the data region, freeing log space.
    pub fn compact(&self) -> Result<()> {
        self.wal.compact()
    }
}

/// A transaction over a [`Txfile`].
///
/// Writes are buffered in a private replacement map and logged to the
/// WAL as they happen; nothing becomes visible to other transactions
/// until [`Transaction::commit`]. Dropping the transaction rolls it
/// back.
pub struct Transaction {
    wal: Arc<WalRegion>,
    /// `None` for read-only transactions.
    tx_id: Option<u32>,
    writes: ReplacementMap,
    new_file_size: Option<u64>,
}

impl Transaction {
    pub fn is_read_only(&self) -> bool {
        self.tx_id.is_none()
    }

    /// Logical file size as seen by this transaction.
    pub fn size(&self) -> u64 {
        self.new_file_size.unwrap_or_else(|| self.wal.size())
    }

    /// Read at `off`, layering transaction-local writes over the
    /// shared state. Returns 0 only at (this transaction's) logical
    /// end of file.
    pub fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if off >= size || buf.is_empty() {
            return Ok(0);
        }
        let mut len = (buf.len() as u64).min(size - off) as usize;

        let n = self.writes.read_at(off, &mut buf[..len]);
        if n != 0 {
            return Ok(n);
        }
        // In a gap of the local map: the shared state may only serve
        // bytes up to our next staged write.
        if let Some(gap) = self.writes.gap_len(off) {
            len = len.min(gap as usize);
        }
        let buf = &mut buf[..len];

        let n = self.wal.read_at(off, buf)?;
        if n != 0 {
            return Ok(n);
        }

        // Past the shared logical end but inside our (resized) view:
        // the not-yet-materialized tail reads as zeroes.
        buf.fill(0);
        Ok(len)
    }

    /// Read exactly `buf.len()` bytes at `off`.
    pub fn read_exact_at(&self, mut off: u64, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.read_at(off, buf)? {
                0 => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "read past logical end of file",
                    )))
                }
                n => {
                    off += n as u64;
                    buf = &mut buf[n..];
                }
            }
        }
        Ok(())
    }

    /// Stage a write at `off`. The range must lie within the file as
    /// seen by this transaction (resize first to grow it).
    pub fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()> {
        let tx_id = self.expect_writable()?;
        let size = self.size();
        if off > size || size - off < data.len() as u64 {
            return Err(Error::WritePastEof {
                offset: off,
                len: data.len() as u64,
                size,
            });
        }

        // Write-ahead first; stage locally only if the log accepted it.
        self.wal.tx_write(tx_id, off, data)?;
        self.writes.write_at(off, data.to_vec()).commit();
        Ok(())
    }

    /// Change the logical file size. Shrinking drops staged writes
    /// beyond the new end.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        let tx_id = self.expect_writable()?;
        self.wal.tx_resize(tx_id, new_size)?;
        self.new_file_size = Some(new_size);
        self.writes.truncate(new_size);
        Ok(())
    }

    /// Commit, discarding the undo image.
    pub fn commit(self) -> Result<()> {
        self.commit_with_undo(|_| {})
    }

    /// Commit; `undo_fn` receives the bytes this commit displaced.
    pub fn commit_with_undo(mut self, undo_fn: impl FnOnce(ReplacementMap)) -> Result<()> {
        let Some(tx_id) = self.tx_id.take() else {
            return Ok(()); // Read-only commit is a no-op.
        };
        let writes = std::mem::take(&mut self.writes);
        self.wal.tx_commit(tx_id, writes, self.new_file_size, undo_fn)
    }

    /// Roll back. Infallible: the private map is dropped and the WAL
    /// transaction id is recycled.
    pub fn rollback(mut self) {
        self.rollback_in_place();
    }

    fn rollback_in_place(&mut self) {
        if let Some(tx_id) = self.tx_id.take() {
            self.wal.tx_rollback(tx_id);
        }
        self.writes.clear();
        self.new_file_size = None;
    }

    fn expect_writable(&self) -> Result<u32> {
        self.tx_id.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "write on read-only transaction",
            ))
        })
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.rollback_in_place();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_txfile() -> Txfile {
        Txfile::create(tempfile::tempfile().unwrap(), 0, 4 << 20).unwrap()
    }

    /// Read the whole logical file.
    fn read_all(tx: &Transaction) -> Vec<u8> {
        let mut out = Vec::new();
        let mut off = 0;
        loop {
            let old_len = out.len();
            out.resize(old_len + 8192, 0);
            let n = tx.read_at(off, &mut out[old_len..]).unwrap();
            out.truncate(old_len + n);
            off += n as u64;
            if n == 0 {
                return out;
            }
        }
    }

    #[test]
    fn resize_write_commit_read_back() {
        let f = tmp_txfile();
        let mut tx = f.begin(false).unwrap();
        tx.resize(6).unwrap();
        tx.write_at(0, b"foobar").unwrap();
        tx.commit().unwrap();

        assert_eq!(read_all(&f.begin(true).unwrap()), b"foobar");
    }

    #[test]
    fn write_past_eof_is_rejected() {
        let f = tmp_txfile();
        let mut tx = f.begin(false).unwrap();
        tx.resize(4).unwrap();
        let err = tx.write_at(2, b"abc").unwrap_err();
        assert!(matches!(err, Error::WritePastEof { .. }));
    }

    #[test]
    fn uncommitted_writes_are_private() {
        let f = tmp_txfile();
        {
            let mut tx = f.begin(false).unwrap();
            tx.resize(3).unwrap();
            tx.write_at(0, b"abc").unwrap();

            // Our own reads see the write; a fresh reader does not.
            let mut buf = [0u8; 3];
            assert_eq!(tx.read_at(0, &mut buf).unwrap(), 3);
            assert_eq!(&buf, b"abc");
            assert_eq!(f.begin(true).unwrap().size(), 0);
        } // Dropped: rolled back.

        assert_eq!(f.size(), 0);
        assert!(read_all(&f.begin(true).unwrap()).is_empty());
    }

    #[test]
    fn last_committed_transaction_wins() {
        let f = tmp_txfile();
        {
            let mut tx = f.begin(false).unwrap();
            tx.resize(1).unwrap();
            tx.write_at(0, b"0").unwrap();
            tx.commit().unwrap();
        }

        let mut tx1 = f.begin(false).unwrap();
        let mut tx2 = f.begin(false).unwrap();
        let mut tx3 = f.begin(false).unwrap();
        tx1.write_at(0, b"1").unwrap();
        tx2.write_at(0, b"2").unwrap();
        tx3.write_at(0, b"3").unwrap();

        tx2.commit().unwrap();
        tx1.commit().unwrap();
        tx3.commit().unwrap();

        assert_eq!(read_all(&f.begin(true).unwrap()), b"3");
    }

    #[test]
    fn staged_writes_mask_committed_data() {
        let f = tmp_txfile();
        {
            let mut tx = f.begin(false).unwrap();
            tx.resize(6).unwrap();
            tx.write_at(0, b"ABCDEF").unwrap();
            tx.commit().unwrap();
        }

        let mut tx = f.begin(false).unwrap();
        tx.write_at(2, b"XY").unwrap();
        // A read crossing the staged range sees the overlay, not the
        // committed bytes underneath it.
        assert_eq!(read_all(&tx), b"ABXYEF");
        tx.rollback();
        assert_eq!(read_all(&f.begin(true).unwrap()), b"ABCDEF");
    }

    #[test]
    fn grown_tail_reads_as_zeroes() {
        let f = tmp_txfile();
        let mut tx = f.begin(false).unwrap();
        tx.resize(16).unwrap();
        tx.write_at(0, b"xy").unwrap();
        tx.commit().unwrap();

        let tx = f.begin(true).unwrap();
        let mut buf = [0xffu8; 16];
        tx.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..2], b"xy");
        assert!(buf[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn shrink_drops_staged_tail() {
        let f = tmp_txfile();
        let mut tx = f.begin(false).unwrap();
        tx.resize(8).unwrap();
        tx.write_at(4, b"tail").unwrap();
        tx.resize(4).unwrap();
        tx.commit().unwrap();

        assert_eq!(f.size(), 4);
        let tx = f.begin(true).unwrap();
        let mut buf = [0xffu8; 4];
        tx.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn survives_reopen() {
        let file = tempfile::tempfile().unwrap();
        {
            let f = Txfile::create(file.try_clone().unwrap(), 0, 1 << 16).unwrap();
            let mut tx = f.begin(false).unwrap();
            tx.resize(5).unwrap();
            tx.write_at(0, b"hello").unwrap();
            tx.commit().unwrap();
        }
        let f = Txfile::open(file, 0, 1 << 16, true).unwrap();
        assert_eq!(read_all(&f.begin(true).unwrap()), b"hello");
    }
}
