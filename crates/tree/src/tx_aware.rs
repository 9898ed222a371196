use monsoon_txfile::CommitId;

const FLAG_PRESENT: u32 = 0x1;
const FLAG_CREATED: u32 = 0x2;
const FLAG_ERASED: u32 = 0x4;

/// Commit-id stamps making an element visible only to a window of
/// readers.
///
/// A reader holding commit-id `r` sees the element iff
/// `creation ≤ r < erasure` under the sliding comparison relative to
/// the reader's `tx_start`. A missing stamp leaves that side of the
/// window open.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxAware {
    pub created: Option<u32>,
    pub erased: Option<u32>,
}

impl TxAware {
    /// On-disk prefix: `{flags: u32, created: u32, erased: u32,
    /// reserved: u32}`, big-endian.
    pub const LEN: usize = 16;

    /// Visible to every reader, forever. Used by bulk loads that
    /// bypass the commit manager.
    pub fn always_visible() -> Self {
        TxAware::default()
    }

    pub fn created_at(commit: CommitId) -> Self {
        TxAware {
            created: Some(commit.val()),
            erased: None,
        }
    }

    /// Creation equals erasure: no reader can ever see this element.
    /// Slots decode as null when this holds.
    pub fn is_never_visible(&self) -> bool {
        match (self.created, self.erased) {
            (Some(c), Some(e)) => c == e,
            _ => false,
        }
    }

    pub fn is_visible_to(&self, reader: CommitId) -> bool {
        let rel = |v: u32| v.wrapping_sub(reader.tx_start());
        let r = rel(reader.val());
        if let Some(c) = self.created {
            if rel(c) > r {
                return false;
            }
        }
        if let Some(e) = self.erased {
            if r >= rel(e) {
                return false;
            }
        }
        true
    }

    /// Encode as the prefix of a non-null slot.
    pub fn encode(&self, out: &mut [u8]) {
        let mut flags = FLAG_PRESENT;
        if self.created.is_some() {
            flags |= FLAG_CREATED;
        }
        if self.erased.is_some() {
            flags |= FLAG_ERASED;
        }
        out[0..4].copy_from_slice(&flags.to_be_bytes());
        out[4..8].copy_from_slice(&self.created.unwrap_or(0).to_be_bytes());
        out[8..12].copy_from_slice(&self.erased.unwrap_or(0).to_be_bytes());
        out[12..16].fill(0);
    }

    /// Decode a slot prefix; `None` for a null (all-zero) slot.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let flags = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if flags & FLAG_PRESENT == 0 {
            return None;
        }
        let created = (flags & FLAG_CREATED != 0)
            .then(|| u32::from_be_bytes(buf[4..8].try_into().unwrap()));
        let erased = (flags & FLAG_ERASED != 0)
            .then(|| u32::from_be_bytes(buf[8..12].try_into().unwrap()));
        Some(TxAware { created, erased })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(val: u32) -> CommitId {
        CommitId::new(0, val)
    }

    #[test]
    fn open_window_is_always_visible() {
        assert!(TxAware::always_visible().is_visible_to(reader(0)));
        assert!(TxAware::always_visible().is_visible_to(reader(u32::MAX)));
    }

    #[test]
    fn creation_bounds_visibility() {
        let tx = TxAware {
            created: Some(10),
            erased: None,
        };
        assert!(!tx.is_visible_to(reader(9)));
        assert!(tx.is_visible_to(reader(10)));
        assert!(tx.is_visible_to(reader(11)));
    }

    #[test]
    fn erasure_ends_visibility() {
        let tx = TxAware {
            created: Some(10),
            erased: Some(20),
        };
        assert!(tx.is_visible_to(reader(19)));
        assert!(!tx.is_visible_to(reader(20)));
    }

    #[test]
    fn equal_stamps_are_never_visible() {
        let tx = TxAware {
            created: Some(7),
            erased: Some(7),
        };
        assert!(tx.is_never_visible());
        assert!(!tx.is_visible_to(reader(7)));
    }

    #[test]
    fn roundtrip() {
        let cases = [
            TxAware::always_visible(),
            TxAware {
                created: Some(1),
                erased: None,
            },
            TxAware {
                created: Some(1),
                erased: Some(9),
            },
        ];
        for tx in cases {
            let mut buf = [0u8; TxAware::LEN];
            tx.encode(&mut buf);
            assert_eq!(TxAware::decode(&buf), Some(tx));
        }
        assert_eq!(TxAware::decode(&[0u8; TxAware::LEN]), None);
    }
}
