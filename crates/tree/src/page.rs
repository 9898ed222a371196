use crate::{Error, FixedCodec, Result, TreeAugment, TreeCfg, TxAware};

pub(crate) const LEAF_MAGIC: u32 = 0x2d54_4c66;
pub(crate) const BRANCH_MAGIC: u32 = 0x2d54_4272;

const LEAF_HEADER_LEN: usize = 32;
const BRANCH_HEADER_LEN: usize = 16;

/// Byte offset of the `parent_off` field, identical in both page
/// layouts so reparenting can patch it without decoding the page.
pub(crate) const PARENT_OFF_FIELD: u64 = 8;

const LEAF_FLAG_HAS_KEY: u32 = 0x1;

/// One occupied leaf slot.
#[derive(Clone, Debug)]
pub(crate) struct Element<K, V> {
    pub tx: TxAware,
    pub key: K,
    pub val: V,
}

/// A leaf page: fixed slot array, sibling links, and the page key —
/// the lower bound of every element the page may hold. The very first
/// page of the tree carries no page key.
#[derive(Clone, Debug)]
pub(crate) struct LeafPage<K, V> {
    pub parent_off: u64,
    pub next_off: u64,
    pub prev_off: u64,
    pub page_key: Option<K>,
    pub slots: Vec<Option<Element<K, V>>>,
}

impl<K: FixedCodec + Clone, V: FixedCodec> LeafPage<K, V> {
    pub fn encoded_size(cfg: &TreeCfg) -> usize {
        LEAF_HEADER_LEN + K::LEN + cfg.items_per_leaf_page * Self::slot_len()
    }

    pub fn slot_len() -> usize {
        TxAware::LEN + K::LEN + V::LEN
    }

    pub fn new_empty(cfg: &TreeCfg) -> Self {
        LeafPage {
            parent_off: 0,
            next_off: 0,
            prev_off: 0,
            page_key: None,
            slots: (0..cfg.items_per_leaf_page).map(|_| None).collect(),
        }
    }

    pub fn encode(&self, cfg: &TreeCfg) -> Vec<u8> {
        let mut out = vec![0u8; Self::encoded_size(cfg)];
        out[0..4].copy_from_slice(&LEAF_MAGIC.to_be_bytes());
        let flags = if self.page_key.is_some() { LEAF_FLAG_HAS_KEY } else { 0 };
        out[4..8].copy_from_slice(&flags.to_be_bytes());
        out[8..16].copy_from_slice(&self.parent_off.to_be_bytes());
        out[16..24].copy_from_slice(&self.next_off.to_be_bytes());
        out[24..32].copy_from_slice(&self.prev_off.to_be_bytes());

        let mut at = LEAF_HEADER_LEN;
        if let Some(key) = &self.page_key {
            key.encode(&mut out[at..at + K::LEN]);
        }
        at += K::LEN;

        for slot in &self.slots {
            if let Some(elem) = slot {
                elem.tx.encode(&mut out[at..at + TxAware::LEN]);
                elem.key.encode(&mut out[at + TxAware::LEN..at + TxAware::LEN + K::LEN]);
                elem.val.encode(&mut out[at + TxAware::LEN + K::LEN..at + Self::slot_len()]);
            }
            at += Self::slot_len();
        }
        debug_assert_eq!(at, out.len());
        out
    }

    pub fn decode(buf: &[u8], cfg: &TreeCfg) -> Result<Self> {
        if buf.len() != Self::encoded_size(cfg) {
            return Err(Error::Consistency("leaf page buffer size mismatch".into()));
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != LEAF_MAGIC {
            return Err(Error::Consistency("bad tree page magic".into()));
        }
        let flags = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let parent_off = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let next_off = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let prev_off = u64::from_be_bytes(buf[24..32].try_into().unwrap());

        let mut at = LEAF_HEADER_LEN;
        let page_key = (flags & LEAF_FLAG_HAS_KEY != 0).then(|| K::decode(&buf[at..at + K::LEN]));
        at += K::LEN;

        let mut slots = Vec::with_capacity(cfg.items_per_leaf_page);
        for _ in 0..cfg.items_per_leaf_page {
            let slot = TxAware::decode(&buf[at..at + TxAware::LEN])
                .filter(|tx| !tx.is_never_visible())
                .map(|tx| Element {
                    tx,
                    key: K::decode(&buf[at + TxAware::LEN..at + TxAware::LEN + K::LEN]),
                    val: V::decode(&buf[at + TxAware::LEN + K::LEN..at + Self::slot_len()]),
                });
            slots.push(slot);
            at += Self::slot_len();
        }

        Ok(LeafPage {
            parent_off,
            next_off,
            prev_off,
            page_key,
            slots,
        })
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn first_occupied(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_some)
    }

    pub fn last_occupied(&self) -> Option<usize> {
        self.slots.iter().rposition(Option::is_some)
    }

    /// Split point: the first occupied slot at or past the midpoint,
    /// adjusted so both halves keep at least one element.
    pub fn split_point(&self) -> Result<usize>
    where
        K: Ord,
    {
        let mid = self.slots.len() / 2;
        let occupied = |slot: &Option<Element<K, V>>| slot.is_some();

        let mut at = mid;
        if !self.slots[..at].iter().any(occupied) {
            // Degenerate: nothing before the midpoint. Skip past the
            // first element so the left half is not empty.
            at = self.slots[at..]
                .iter()
                .position(occupied)
                .map(|i| at + i + 1)
                .ok_or_else(|| Error::Consistency("cannot split empty page".into()))?;
        }
        self.slots[at..]
            .iter()
            .position(occupied)
            .map(|i| at + i)
            .ok_or_else(|| Error::Consistency("cannot split page with only 1 element".into()))
    }
}

/// A child entry of a branch page: the child's offset plus the augment
/// summarizing its subtree.
#[derive(Clone, Debug)]
pub(crate) struct ChildRef<A> {
    pub off: u64,
    pub augment: A,
}

/// A branch page: `size` child entries interleaved with `size - 1`
/// separator keys.
#[derive(Clone, Debug)]
pub(crate) struct BranchPage<K, A> {
    pub parent_off: u64,
    pub children: Vec<ChildRef<A>>,
    pub keys: Vec<K>,
}

impl<K: FixedCodec + Ord + Clone, A: FixedCodec> BranchPage<K, A> {
    pub fn encoded_size(cfg: &TreeCfg) -> usize {
        BRANCH_HEADER_LEN
            + (cfg.items_per_node_page - 1) * K::LEN
            + cfg.items_per_node_page * Self::elem_len()
    }

    fn elem_len() -> usize {
        8 + A::LEN
    }

    pub fn encode(&self, cfg: &TreeCfg) -> Vec<u8> {
        debug_assert!(self.children.len() <= cfg.items_per_node_page);
        debug_assert_eq!(self.keys.len() + 1, self.children.len());

        let mut out = vec![0u8; Self::encoded_size(cfg)];
        out[0..4].copy_from_slice(&BRANCH_MAGIC.to_be_bytes());
        out[4..8].copy_from_slice(&(self.children.len() as u32).to_be_bytes());
        out[8..16].copy_from_slice(&self.parent_off.to_be_bytes());

        let mut at = BRANCH_HEADER_LEN;
        for (i, child) in self.children.iter().enumerate() {
            if i != 0 {
                self.keys[i - 1].encode(&mut out[at..at + K::LEN]);
                at += K::LEN;
            }
            out[at..at + 8].copy_from_slice(&child.off.to_be_bytes());
            child.augment.encode(&mut out[at + 8..at + Self::elem_len()]);
            at += Self::elem_len();
        }
        out
    }

    pub fn decode(buf: &[u8], cfg: &TreeCfg) -> Result<Self> {
        if buf.len() != Self::encoded_size(cfg) {
            return Err(Error::Consistency("branch page buffer size mismatch".into()));
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != BRANCH_MAGIC {
            return Err(Error::Consistency("bad tree page magic".into()));
        }
        let size = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        if size > cfg.items_per_node_page {
            return Err(Error::Consistency("too many items in tree branch".into()));
        }
        let parent_off = u64::from_be_bytes(buf[8..16].try_into().unwrap());

        let mut children = Vec::with_capacity(size);
        let mut keys = Vec::with_capacity(size.saturating_sub(1));
        let mut at = BRANCH_HEADER_LEN;
        for i in 0..size {
            if i != 0 {
                keys.push(K::decode(&buf[at..at + K::LEN]));
                at += K::LEN;
            }
            let off = u64::from_be_bytes(buf[at..at + 8].try_into().unwrap());
            let augment = A::decode(&buf[at + 8..at + Self::elem_len()]);
            children.push(ChildRef { off, augment });
            at += Self::elem_len();
        }

        Ok(BranchPage {
            parent_off,
            children,
            keys,
        })
    }

    pub fn is_full(&self, cfg: &TreeCfg) -> bool {
        self.children.len() >= cfg.items_per_node_page
    }

    /// Index of the child responsible for `key`: separators bind
    /// equal keys to the right-hand child.
    pub fn search_child(&self, key: &K) -> usize {
        self.keys.partition_point(|sep| sep <= key)
    }

    pub fn child_index_of(&self, off: u64) -> Option<usize> {
        self.children.iter().position(|c| c.off == off)
    }
}

/// A decoded tree page.
#[derive(Clone, Debug)]
pub(crate) enum PageKind<K, V, A> {
    Leaf(LeafPage<K, V>),
    Branch(BranchPage<K, A>),
}

impl<K, V, A> PageKind<K, V, A>
where
    K: FixedCodec + Ord + Clone,
    V: FixedCodec,
    A: TreeAugment<K, V>,
{
    /// Dispatch on the magic in the first four bytes. `buf` must be
    /// large enough for whichever page type it turns out to be.
    pub fn decode(buf: &[u8], cfg: &TreeCfg) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Consistency("tree page too short".into()));
        }
        match u32::from_be_bytes(buf[0..4].try_into().unwrap()) {
            LEAF_MAGIC => Ok(PageKind::Leaf(LeafPage::decode(
                &buf[..LeafPage::<K, V>::encoded_size(cfg)],
                cfg,
            )?)),
            BRANCH_MAGIC => Ok(PageKind::Branch(BranchPage::decode(
                &buf[..BranchPage::<K, A>::encoded_size(cfg)],
                cfg,
            )?)),
            _ => Err(Error::Consistency("bad tree page magic".into())),
        }
    }

    pub fn encode(&self, cfg: &TreeCfg) -> Vec<u8> {
        match self {
            PageKind::Leaf(leaf) => leaf.encode(cfg),
            PageKind::Branch(branch) => branch.encode(cfg),
        }
    }

    pub fn parent_off(&self) -> u64 {
        match self {
            PageKind::Leaf(leaf) => leaf.parent_off,
            PageKind::Branch(branch) => branch.parent_off,
        }
    }

    pub fn set_parent_off(&mut self, off: u64) {
        match self {
            PageKind::Leaf(leaf) => leaf.parent_off = off,
            PageKind::Branch(branch) => branch.parent_off = off,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafPage<K, V>> {
        match self {
            PageKind::Leaf(leaf) => Some(leaf),
            PageKind::Branch(_) => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut LeafPage<K, V>> {
        match self {
            PageKind::Leaf(leaf) => Some(leaf),
            PageKind::Branch(_) => None,
        }
    }

    pub fn as_branch(&self) -> Option<&BranchPage<K, A>> {
        match self {
            PageKind::Branch(branch) => Some(branch),
            PageKind::Leaf(_) => None,
        }
    }

    pub fn as_branch_mut(&mut self) -> Option<&mut BranchPage<K, A>> {
        match self {
            PageKind::Branch(branch) => Some(branch),
            PageKind::Leaf(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoAugment;

    fn cfg() -> TreeCfg {
        TreeCfg::new(4, 4)
    }

    fn elem(key: u64, val: u32) -> Option<Element<u64, u32>> {
        Some(Element {
            tx: TxAware::always_visible(),
            key,
            val,
        })
    }

    #[test]
    fn leaf_roundtrip() {
        let mut leaf = LeafPage::<u64, u32>::new_empty(&cfg());
        leaf.parent_off = 0x100;
        leaf.next_off = 0x200;
        leaf.prev_off = 0x300;
        leaf.page_key = Some(5);
        leaf.slots[0] = elem(5, 50);
        leaf.slots[2] = elem(9, 90);

        let bytes = leaf.encode(&cfg());
        let back = LeafPage::<u64, u32>::decode(&bytes, &cfg()).unwrap();

        assert_eq!(back.parent_off, 0x100);
        assert_eq!(back.next_off, 0x200);
        assert_eq!(back.prev_off, 0x300);
        assert_eq!(back.page_key, Some(5));
        assert!(back.slots[0].is_some() && back.slots[1].is_none());
        assert_eq!(back.slots[2].as_ref().unwrap().val, 90);
    }

    #[test]
    fn never_visible_slot_decodes_as_null() {
        let mut leaf = LeafPage::<u64, u32>::new_empty(&cfg());
        leaf.slots[1] = Some(Element {
            tx: TxAware {
                created: Some(3),
                erased: Some(3),
            },
            key: 1,
            val: 2,
        });
        let bytes = leaf.encode(&cfg());
        let back = LeafPage::<u64, u32>::decode(&bytes, &cfg()).unwrap();
        assert!(back.slots[1].is_none());
    }

    #[test]
    fn branch_roundtrip() {
        let branch = BranchPage::<u64, NoAugment> {
            parent_off: 7,
            children: vec![
                ChildRef { off: 100, augment: NoAugment },
                ChildRef { off: 200, augment: NoAugment },
                ChildRef { off: 300, augment: NoAugment },
            ],
            keys: vec![10, 20],
        };
        let bytes = branch.encode(&cfg());
        let back = BranchPage::<u64, NoAugment>::decode(&bytes, &cfg()).unwrap();
        assert_eq!(back.parent_off, 7);
        assert_eq!(back.keys, vec![10, 20]);
        assert_eq!(back.children.len(), 3);
        assert_eq!(back.children[1].off, 200);
    }

    #[test]
    fn magic_dispatch() {
        let leaf = LeafPage::<u64, u32>::new_empty(&cfg());
        let bytes = leaf.encode(&cfg());
        assert!(matches!(
            PageKind::<u64, u32, NoAugment>::decode(&bytes, &cfg()).unwrap(),
            PageKind::Leaf(_)
        ));

        let mut corrupt = bytes;
        corrupt[0] ^= 0xff;
        assert!(matches!(
            PageKind::<u64, u32, NoAugment>::decode(&corrupt, &cfg()),
            Err(Error::Consistency(_))
        ));
    }

    #[test]
    fn search_child_sends_equal_keys_right() {
        let branch = BranchPage::<u64, NoAugment> {
            parent_off: 0,
            children: vec![
                ChildRef { off: 1, augment: NoAugment },
                ChildRef { off: 2, augment: NoAugment },
                ChildRef { off: 3, augment: NoAugment },
            ],
            keys: vec![10, 20],
        };
        assert_eq!(branch.search_child(&5), 0);
        assert_eq!(branch.search_child(&10), 1);
        assert_eq!(branch.search_child(&15), 1);
        assert_eq!(branch.search_child(&20), 2);
        assert_eq!(branch.search_child(&25), 2);
    }

    #[test]
    fn split_point_prefers_midpoint() {
        let mut leaf = LeafPage::<u64, u32>::new_empty(&cfg());
        for i in 0..4 {
            leaf.slots[i] = elem(i as u64, 0);
        }
        assert_eq!(leaf.split_point().unwrap(), 2);
    }

    #[test]
    fn split_point_scans_past_null_run() {
        let mut leaf = LeafPage::<u64, u32>::new_empty(&cfg());
        // Only slots 2 and 3 occupied: midpoint falls in a null run.
        leaf.slots[2] = elem(2, 0);
        leaf.slots[3] = elem(3, 0);
        assert_eq!(leaf.split_point().unwrap(), 3);
    }

    #[test]
    fn split_point_rejects_single_element() {
        let mut leaf = LeafPage::<u64, u32>::new_empty(&cfg());
        leaf.slots[3] = elem(3, 0);
        assert!(leaf.split_point().is_err());
    }
}
