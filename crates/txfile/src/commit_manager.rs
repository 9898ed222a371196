use std::sync::Arc;

use parking_lot::Mutex;

use crate::{sliding_lt, Error, Result, Transaction, Txfile};

/// Magic of the persisted commit-manager record.
pub const COMMIT_MANAGER_MAGIC: u32 = 0x697f_6431;

const RECORD_LEN: usize = 16;

/// A commit sequence number: the visibility horizon of a reader.
///
/// `tx_start` is the oldest sequence number still relevant to any
/// reader; `val` compares under the sliding-window ordering relative
/// to it, so the 32-bit space can wrap without disturbing order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommitId {
    tx_start: u32,
    val: u32,
}

impl CommitId {
    pub fn new(tx_start: u32, val: u32) -> Self {
        CommitId { tx_start, val }
    }

    pub fn tx_start(&self) -> u32 {
        self.tx_start
    }

    pub fn val(&self) -> u32 {
        self.val
    }

    /// Distance from `tx_start`; the value the ordering is defined on.
    pub fn relative(&self) -> u32 {
        self.val.wrapping_sub(self.tx_start)
    }
}

impl PartialOrd for CommitId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommitId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        debug_assert_eq!(self.tx_start, other.tx_start);
        self.relative().cmp(&other.relative())
    }
}

struct State {
    tx_start: u32,
    last_write: u32,
    completed: u32,
}

/// Monotonic commit-sequence allocator, persisted as
/// `{magic, tx_start, last_write, completed}` in 16 bytes at a fixed
/// offset of a [`Txfile`].
///
/// Invariant (in the sliding sense): `tx_start ≤ completed ≤
/// last_write`. Readers snapshot `completed`; writers draw strictly
/// increasing values above it and promote `completed` only after their
/// commit fully applied, so failed prepares leave harmless gaps.
pub struct CommitManager {
    f: Txfile,
    off: u64,
    state: Mutex<State>,
}

impl CommitManager {
    /// Write a fresh record at `off`, all sequence numbers starting at
    /// `tx_start`. The transaction must already cover `off + 16` bytes.
    pub fn init(tx: &mut Transaction, off: u64, tx_start: u32) -> Result<()> {
        let mut buf = [0u8; RECORD_LEN];
        buf[0..4].copy_from_slice(&COMMIT_MANAGER_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&tx_start.to_be_bytes());
        buf[8..12].copy_from_slice(&tx_start.to_be_bytes());
        buf[12..16].copy_from_slice(&tx_start.to_be_bytes());
        tx.write_at(off, &buf)
    }

    /// Read and verify the record at `off`.
    pub fn allocate(f: &Txfile, off: u64) -> Result<Arc<CommitManager>> {
        let tx = f.begin(true)?;
        let mut buf = [0u8; RECORD_LEN];
        tx.read_exact_at(off, &mut buf)?;

        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != COMMIT_MANAGER_MAGIC {
            return Err(Error::BadMagic);
        }

        Ok(Arc::new(CommitManager {
            f: f.clone(),
            off,
            state: Mutex::new(State {
                tx_start: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
                last_write: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
                completed: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            }),
        }))
    }

    /// Commit id for a new read transaction: the latest completed
    /// commit.
    pub fn get_tx_commit_id(&self) -> CommitId {
        let state = self.state.lock();
        CommitId::new(state.tx_start, state.completed)
    }

    /// Draw the next write sequence number, persisting `last_write`.
    ///
    /// Does not move `completed`: readers keep seeing the old state
    /// until the returned [`WriteId`] is applied.
    pub fn prepare_commit(self: &Arc<Self>) -> Result<WriteId> {
        let mut state = self.state.lock();
        let val = state.last_write.wrapping_add(1);

        let mut tx = self.f.begin(false)?;
        tx.write_at(self.off + 8, &val.to_be_bytes())?;
        tx.commit()?;

        state.last_write = val;
        Ok(WriteId {
            cm: Arc::clone(self),
            seq: CommitId::new(state.tx_start, val),
        })
    }
}

/// A prepared commit slot handed out by
/// [`CommitManager::prepare_commit`].
#[must_use = "an unapplied WriteId leaves a (harmless) gap in the sequence"]
pub struct WriteId {
    cm: Arc<CommitManager>,
    seq: CommitId,
}

impl WriteId {
    pub fn seq(&self) -> CommitId {
        self.seq
    }

    /// Two-phase apply.
    ///
    /// 1. `validate` may reject the commit; its error is returned and
    ///    `completed` stays untouched.
    /// 2. `phase2` performs the in-memory flip; it must not fail.
    /// 3. `completed` advances to this id, on disk and in memory.
    pub fn apply(
        self,
        validate: impl FnOnce() -> Result<()>,
        phase2: impl FnOnce(),
    ) -> Result<()> {
        validate()?;
        phase2();

        let mut state = self.cm.state.lock();
        if sliding_lt(state.completed, self.seq.val()) {
            let mut tx = self.cm.f.begin(false)?;
            tx.write_at(self.cm.off + 12, &self.seq.val().to_be_bytes())?;
            tx.commit()?;
            state.completed = self.seq.val();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tmp_txfile() -> Txfile {
        Txfile::create(tempfile::tempfile().unwrap(), 0, 1 << 20).unwrap()
    }

    fn file_with_inits(tx_start: u32, last_write: u32, completed: u32) -> Txfile {
        let f = tmp_txfile();
        let mut tx = f.begin(false).unwrap();
        tx.resize(RECORD_LEN as u64).unwrap();
        let mut buf = [0u8; RECORD_LEN];
        buf[0..4].copy_from_slice(&COMMIT_MANAGER_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&tx_start.to_be_bytes());
        buf[8..12].copy_from_slice(&last_write.to_be_bytes());
        buf[12..16].copy_from_slice(&completed.to_be_bytes());
        tx.write_at(0, &buf).unwrap();
        tx.commit().unwrap();
        f
    }

    fn read_all(f: &Txfile) -> Vec<u8> {
        let tx = f.begin(true).unwrap();
        let mut out = vec![0u8; f.size() as usize];
        tx.read_exact_at(0, &mut out).unwrap();
        out
    }

    #[test]
    fn new_file_layout() {
        let f = tmp_txfile();
        let mut tx = f.begin(false).unwrap();
        tx.resize(RECORD_LEN as u64).unwrap();
        CommitManager::init(&mut tx, 0, 0).unwrap();
        tx.commit().unwrap();

        assert_eq!(
            read_all(&f),
            vec![
                0x69, 0x7f, 0x64, 0x31, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00, //
                0x00, 0x00, 0x00, 0x00,
            ],
        );
    }

    #[test]
    fn allocate_rejects_bad_magic() {
        let f = tmp_txfile();
        let mut tx = f.begin(false).unwrap();
        tx.resize(RECORD_LEN as u64).unwrap();
        tx.commit().unwrap();

        assert!(matches!(
            CommitManager::allocate(&f, 0),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn get_tx_commit_id() {
        let f = file_with_inits(1, 17, 15);
        let cm = CommitManager::allocate(&f, 0).unwrap();
        let ci = cm.get_tx_commit_id();
        assert_eq!(ci.tx_start(), 1);
        assert_eq!(ci.val(), 15);
        // Repeats until something commits.
        assert_eq!(cm.get_tx_commit_id(), ci);
    }

    #[test]
    fn prepare_commit_does_not_move_readers() {
        let f = file_with_inits(1, 17, 15);
        let cm = CommitManager::allocate(&f, 0).unwrap();
        let before = cm.get_tx_commit_id();

        let wi = cm.prepare_commit().unwrap();
        assert_eq!(wi.seq().tx_start(), 1);
        assert_eq!(wi.seq().val(), 18);

        assert_eq!(cm.get_tx_commit_id(), before);

        // Never hands out the same value twice.
        assert_ne!(cm.prepare_commit().unwrap().seq(), wi.seq());
    }

    #[test]
    fn apply_advances_completed() {
        let f = file_with_inits(1, 17, 15);
        let cm = CommitManager::allocate(&f, 0).unwrap();

        let wi = cm.prepare_commit().unwrap();
        assert_eq!(wi.seq().val(), 18);

        let mut validated = false;
        let mut flipped = false;
        wi.apply(
            || {
                validated = true;
                Ok(())
            },
            || flipped = true,
        )
        .unwrap();
        assert!(validated && flipped);
        assert_eq!(cm.get_tx_commit_id().val(), 18);

        // Also persisted.
        let bytes = read_all(&f);
        assert_eq!(&bytes[12..16], &18u32.to_be_bytes());
    }

    #[test]
    fn failed_validation_leaves_completed_untouched() {
        let f = file_with_inits(1, 17, 15);
        let cm = CommitManager::allocate(&f, 0).unwrap();
        let before = cm.get_tx_commit_id();

        let wi = cm.prepare_commit().unwrap();
        let mut flipped = false;
        let err = wi
            .apply(
                || Err(Error::TxConflict("validation says no".into())),
                || flipped = true,
            )
            .unwrap_err();

        assert!(matches!(err, Error::TxConflict(_)));
        assert!(!flipped);
        assert_eq!(cm.get_tx_commit_id(), before);
    }

    #[test]
    fn sequence_wraps_safely() {
        let f = file_with_inits(0xffff_fff0, 0xffff_ffff, 0xffff_ffff);
        let cm = CommitManager::allocate(&f, 0).unwrap();

        let wi = cm.prepare_commit().unwrap();
        assert_eq!(wi.seq().val(), 0); // Wrapped.
        wi.apply(|| Ok(()), || {}).unwrap();
        assert_eq!(cm.get_tx_commit_id().val(), 0);
    }
}
