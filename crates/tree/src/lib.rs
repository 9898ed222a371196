//! Transaction-aware B⁺-tree pages over a [`monsoon_txfile::Txfile`].
//!
//! Only leaves carry elements; branches carry separator keys, child
//! offsets and *augments* — monoid summaries of entire subtrees that
//! queries can prune on. Every element is stamped with creation and
//! erasure commit-ids, so readers holding a commit-id see a consistent
//! snapshot.
//!
//! Every structural mutation (insert, page split, root push) is a
//! single txfile transaction; in-memory state is only touched through
//! the [`TxOpCollection`] so a failed transaction leaves the loaded
//! pages exactly as they were.

mod cfg;
mod ops;
mod page;
mod tree;
mod tx_aware;

pub use cfg::TreeCfg;
pub use ops::TxOpCollection;
pub use tree::Tree;
pub use tx_aware::TxAware;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A page failed a structural check: bad magic, oversized branch,
    /// broken sibling links or ordering.
    #[error("tree consistency: {0}")]
    Consistency(String),

    #[error(transparent)]
    Txfile(#[from] monsoon_txfile::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fixed-width big-endian codec for keys, values and augments.
///
/// `decode` must accept any `LEN`-byte pattern; tree pages zero-fill
/// unused slots and re-decode them as absent via the tx-aware prefix,
/// never through the codec.
pub trait FixedCodec: Sized {
    const LEN: usize;

    /// Encode into `out`, which is exactly `LEN` bytes.
    fn encode(&self, out: &mut [u8]);

    /// Decode from exactly `LEN` bytes.
    fn decode(buf: &[u8]) -> Self;
}

/// Key bound. The tree orders keys with `Ord`, which must agree with
/// the big-endian byte order of the encoding for on-disk ordering to
/// hold.
pub trait TreeKey: FixedCodec + Ord + Clone + Send + Sync + 'static {}
impl<T: FixedCodec + Ord + Clone + Send + Sync + 'static> TreeKey for T {}

/// Value bound.
pub trait TreeValue: FixedCodec + Clone + Send + Sync + 'static {}
impl<T: FixedCodec + Clone + Send + Sync + 'static> TreeValue for T {}

/// A monoid summarizing a subtree, stored on the parent's child entry.
///
/// `Default` is the identity element; `merge` must be associative.
pub trait TreeAugment<K, V>: FixedCodec + Clone + Default + Send + Sync + 'static {
    fn from_element(key: &K, value: &V) -> Self;
    fn merge(&self, other: &Self) -> Self;
}

/// The trivial augment: summarizes nothing, prunes nothing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NoAugment;

impl FixedCodec for NoAugment {
    const LEN: usize = 0;

    fn encode(&self, _out: &mut [u8]) {}

    fn decode(_buf: &[u8]) -> Self {
        NoAugment
    }
}

impl<K, V> TreeAugment<K, V> for NoAugment {
    fn from_element(_key: &K, _value: &V) -> Self {
        NoAugment
    }

    fn merge(&self, _other: &Self) -> Self {
        NoAugment
    }
}

impl FixedCodec for u32 {
    const LEN: usize = 4;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u32::from_be_bytes(buf.try_into().unwrap())
    }
}

impl FixedCodec for u64 {
    const LEN: usize = 8;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u64::from_be_bytes(buf.try_into().unwrap())
    }
}

impl FixedCodec for () {
    const LEN: usize = 0;

    fn encode(&self, _out: &mut [u8]) {}

    fn decode(_buf: &[u8]) -> Self {}
}
