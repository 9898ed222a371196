use std::collections::{BTreeSet, HashMap};
use std::ops::ControlFlow;
use std::sync::Arc;

use log::debug;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};

use monsoon_txfile::{CommitId, Transaction, Txfile};

use crate::page::{BranchPage, ChildRef, Element, LeafPage, PageKind, PARENT_OFF_FIELD};
use crate::{Error, Result, TreeAugment, TreeCfg, TreeKey, TreeValue, TxAware, TxOpCollection};

const TREE_MAGIC: u32 = 0x2d54_5248;
const HEADER_LEN: usize = 16;

struct PageBuf<K, V, A> {
    off: u64,
    kind: PageKind<K, V, A>,
}

type PageCell<K, V, A> = Arc<RwLock<PageBuf<K, V, A>>>;
type PageTable<K, V, A> = Arc<Mutex<HashMap<u64, PageCell<K, V, A>>>>;
type PageWriteGuard<K, V, A> = ArcRwLockWriteGuard<RawRwLock, PageBuf<K, V, A>>;

/// A B⁺-tree with tx-aware elements and augmented branches, stored in
/// a [`Txfile`].
///
/// Writers serialize on the tree root lock and descend taking page
/// write locks top-down, splitting full pages preemptively on the way
/// so a split never has to climb back up against the lock order.
/// Readers take the root lock shared and page read locks along their
/// path.
///
/// All on-disk effects of one structural operation form a single
/// txfile transaction. Loaded pages are mutated only under rollback
/// protection: if the transaction fails, snapshots and the
/// [`TxOpCollection`] rollback closures restore every page, and new
/// pages are registered with the tree only by on-commit closures.
pub struct Tree<K, V, A> {
    file: Txfile,
    cfg: TreeCfg,
    header_off: u64,
    root: Arc<RwLock<u64>>,
    pages: PageTable<K, V, A>,
}

impl<K: TreeKey, V: TreeValue, A: TreeAugment<K, V>> Tree<K, V, A> {
    /// Initialize an empty tree: writes the 16-byte tree header at
    /// `header_off`. The first insert allocates the root page.
    pub fn create(file: Txfile, header_off: u64, cfg: TreeCfg) -> Result<Self> {
        let mut tx = file.begin(false)?;
        if tx.size() < header_off + HEADER_LEN as u64 {
            tx.resize(header_off + HEADER_LEN as u64)?;
        }
        let mut hdr = [0u8; HEADER_LEN];
        hdr[0..4].copy_from_slice(&TREE_MAGIC.to_be_bytes());
        tx.write_at(header_off, &hdr)?;
        tx.commit()?;

        Ok(Tree {
            file,
            cfg,
            header_off,
            root: Arc::new(RwLock::new(0)),
            pages: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Attach to an existing tree.
    pub fn open(file: Txfile, header_off: u64, cfg: TreeCfg) -> Result<Self> {
        let tx = file.begin(true)?;
        let mut hdr = [0u8; HEADER_LEN];
        tx.read_exact_at(header_off, &mut hdr)?;
        if u32::from_be_bytes(hdr[0..4].try_into().unwrap()) != TREE_MAGIC {
            return Err(Error::Consistency("bad tree header magic".into()));
        }
        let root_off = u64::from_be_bytes(hdr[8..16].try_into().unwrap());

        Ok(Tree {
            file,
            cfg,
            header_off,
            root: Arc::new(RwLock::new(root_off)),
            pages: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn cfg(&self) -> &TreeCfg {
        &self.cfg
    }

    /// Drop the loaded copy of the page at `off`; the next access
    /// decodes it from the file again.
    pub fn invalidate(&self, off: u64) {
        self.pages.lock().remove(&off);
    }

    fn max_page_size(&self) -> usize {
        LeafPage::<K, V>::encoded_size(&self.cfg).max(BranchPage::<K, A>::encoded_size(&self.cfg))
    }

    /// Load a page through the page table, decoding on miss.
    fn get_page(&self, off: u64) -> Result<PageCell<K, V, A>> {
        let mut pages = self.pages.lock();
        if let Some(cell) = pages.get(&off) {
            return Ok(Arc::clone(cell));
        }

        let tx = self.file.begin(true)?;
        let mut buf = vec![0u8; self.max_page_size()];
        read_prefix(&tx, off, &mut buf)?;
        let kind = PageKind::decode(&buf, &self.cfg)?;

        let cell = Arc::new(RwLock::new(PageBuf { off, kind }));
        pages.insert(off, Arc::clone(&cell));
        Ok(cell)
    }

    /// Append `len` bytes to the file, returning their offset.
    fn alloc_bytes(&self, tx: &mut Transaction, len: usize) -> Result<u64> {
        let off = tx.size();
        tx.resize(off + len as u64)?;
        Ok(off)
    }

    fn write_root_pointer(&self, tx: &mut Transaction, root_off: u64) -> Result<()> {
        tx.write_at(self.header_off + 8, &root_off.to_be_bytes())
            .map_err(Into::into)
    }

    /// Insert `key` with the given commit-id stamps.
    ///
    /// Returns `false` (leaving the element in place) when an element
    /// with an equal key already exists. Splits performed on the way
    /// down are committed even then.
    pub fn insert(&self, key: K, stamp: TxAware, value: V) -> Result<bool> {
        self.insert_with(key, move || Ok((stamp, value)))
    }

    /// Insert with a fallible element constructor.
    ///
    /// `make` runs once the slot has been prepared; if it fails, the
    /// whole operation — slot shifts included — is rolled back and the
    /// error surfaces unchanged.
    pub fn insert_with(
        &self,
        key: K,
        make: impl FnOnce() -> Result<(TxAware, V)>,
    ) -> Result<bool> {
        let mut ops = TxOpCollection::new();
        let root_cell = Arc::clone(&self.root);
        let mut root_guard = root_cell.write();
        let root_before = *root_guard;

        let mut ctx = InsertCtx::new();
        let mut tx = self.file.begin(false)?;

        let outcome = self
            .insert_locked(&mut tx, &mut ops, &mut ctx, &mut root_guard, key, make)
            .and_then(|inserted| {
                if !ctx.dirty.is_empty() {
                    // Encode every touched page, then make the whole
                    // mutation durable at once.
                    for &idx in &ctx.dirty {
                        let page = &ctx.guards[idx];
                        tx.write_at(page.off, &page.kind.encode(&self.cfg))?;
                    }
                    tx.commit()?;
                }
                Ok(inserted)
            });

        match outcome {
            Ok(inserted) => {
                ops.commit();
                Ok(inserted)
            }
            Err(err) => {
                // Revert the pages we hold, then — still under the
                // root lock — the ones touched without a held lock,
                // via the rollback closures. The transaction never
                // reached the file.
                for (idx, snapshot) in ctx.undo_pages.drain(..).rev() {
                    ctx.guards[idx].kind = snapshot;
                }
                *root_guard = root_before;
                drop(ctx);
                drop(ops);
                Err(err)
            }
        }
    }

    fn insert_locked(
        &self,
        tx: &mut Transaction,
        ops: &mut TxOpCollection,
        ctx: &mut InsertCtx<K, V, A>,
        root_guard: &mut u64,
        key: K,
        make: impl FnOnce() -> Result<(TxAware, V)>,
    ) -> Result<bool> {
        // Grow a root if the tree is empty.
        if *root_guard == 0 {
            let off = self.alloc_bytes(tx, LeafPage::<K, V>::encoded_size(&self.cfg))?;
            self.write_root_pointer(tx, off)?;
            *root_guard = off;
            debug!("tree: allocated root leaf at {off}");
            ctx.add_new_page(off, PageKind::Leaf(LeafPage::new_empty(&self.cfg)), &self.pages, ops);
        }

        // Descend, splitting full pages before entering them so every
        // split finds a parent with room.
        let mut cur = match ctx.index_of(*root_guard) {
            Some(idx) => idx,
            None => ctx.push_guard(self.get_page(*root_guard)?),
        };
        ctx.spine.push(cur);

        if self.page_is_full(&ctx.guards[cur].kind) {
            cur = self.push_root_level(tx, ops, ctx, root_guard, &key)?;
        }

        loop {
            let child_off = match &ctx.guards[cur].kind {
                PageKind::Branch(branch) => branch.children[branch.search_child(&key)].off,
                PageKind::Leaf(_) => break,
            };

            let mut child = ctx.push_guard(self.get_page(child_off)?);
            if self.page_is_full(&ctx.guards[child].kind) {
                let split = self.split_child(tx, ops, ctx, cur, child)?;
                child = split.pick(&key);
            }
            ctx.spine.push(child);
            cur = child;
        }

        self.insert_into_leaf(ctx, cur, key, make)
    }

    fn page_is_full(&self, kind: &PageKind<K, V, A>) -> bool {
        match kind {
            PageKind::Leaf(leaf) => leaf.is_full(),
            PageKind::Branch(branch) => branch.is_full(&self.cfg),
        }
    }

    /// The root page is full: put a new branch above it, then split
    /// the old root as its only child.
    fn push_root_level(
        &self,
        tx: &mut Transaction,
        ops: &mut TxOpCollection,
        ctx: &mut InsertCtx<K, V, A>,
        root_guard: &mut u64,
        key: &K,
    ) -> Result<usize> {
        let old_root = ctx.spine.pop().expect("root is on the spine");
        let old_off = ctx.guards[old_root].off;

        let new_off = self.alloc_bytes(tx, BranchPage::<K, A>::encoded_size(&self.cfg))?;
        let augment = self.compute_augment(&ctx.guards[old_root].kind);
        let new_root = BranchPage {
            parent_off: 0,
            children: vec![ChildRef {
                off: old_off,
                augment,
            }],
            keys: Vec::new(),
        };
        let root_idx = ctx.add_new_page(new_off, PageKind::Branch(new_root), &self.pages, ops);

        ctx.touch(old_root);
        ctx.guards[old_root].kind.set_parent_off(new_off);

        self.write_root_pointer(tx, new_off)?;
        *root_guard = new_off;
        debug!("tree: pushed root level, new root branch at {new_off}");

        ctx.spine.push(root_idx);
        let split = self.split_child(tx, ops, ctx, root_idx, old_root)?;
        let chosen = split.pick(key);
        ctx.spine.push(chosen);
        Ok(chosen)
    }

    /// Half-split `child` (which is full) under `parent` (which has
    /// room).
    fn split_child(
        &self,
        tx: &mut Transaction,
        ops: &mut TxOpCollection,
        ctx: &mut InsertCtx<K, V, A>,
        parent: usize,
        child: usize,
    ) -> Result<Split<K>> {
        let child_off = ctx.guards[child].off;
        let parent_off = ctx.guards[parent].off;

        let (sep_key, sib_size) = match &ctx.guards[child].kind {
            PageKind::Leaf(leaf) => {
                let at = leaf.split_point()?;
                let sep = leaf.slots[at]
                    .as_ref()
                    .expect("split point is occupied")
                    .key
                    .clone();
                (sep, LeafPage::<K, V>::encoded_size(&self.cfg))
            }
            PageKind::Branch(branch) => {
                if branch.children.len() <= 2 {
                    return Err(Error::Consistency(
                        "not enough entries to split branch page".into(),
                    ));
                }
                let at = branch.children.len() / 2;
                (
                    branch.keys[at - 1].clone(),
                    BranchPage::<K, A>::encoded_size(&self.cfg),
                )
            }
        };

        let sib_off = self.alloc_bytes(tx, sib_size)?;

        // Move the upper half out of the child.
        ctx.touch(child);
        let sibling = match &mut ctx.guards[child].kind {
            PageKind::Leaf(leaf) => {
                let at = leaf.split_point()?;
                let mut sib = LeafPage::new_empty(&self.cfg);
                sib.parent_off = parent_off;
                sib.prev_off = child_off;
                sib.next_off = leaf.next_off;
                sib.page_key = Some(sep_key.clone());
                for (i, slot) in leaf.slots[at..].iter_mut().enumerate() {
                    sib.slots[i] = slot.take();
                }
                leaf.next_off = sib_off;
                PageKind::Leaf(sib)
            }
            PageKind::Branch(branch) => {
                let at = branch.children.len() / 2;
                let sib = BranchPage {
                    parent_off,
                    children: branch.children.split_off(at),
                    keys: branch.keys.split_off(at),
                };
                // The separator between the halves is promoted into
                // the parent, not copied.
                branch.keys.pop();
                PageKind::Branch(sib)
            }
        };

        // Fix up the neighbours the sibling now sits between.
        match &sibling {
            PageKind::Leaf(sib) => {
                if sib.next_off != 0 {
                    // The old successor's back link moves to the
                    // sibling.
                    let succ = self.get_page(sib.next_off)?;
                    let mut succ_guard = succ.write();
                    let snapshot = succ_guard.kind.clone();
                    let succ_cell = Arc::clone(&succ);
                    ops.on_rollback(move || {
                        succ_cell.write().kind = snapshot;
                    });
                    if let Some(leaf) = succ_guard.kind.as_leaf_mut() {
                        leaf.prev_off = sib_off;
                    }
                    tx.write_at(succ_guard.off, &succ_guard.kind.encode(&self.cfg))?;
                }
            }
            PageKind::Branch(sib) => {
                // Children that moved under the sibling get their
                // parent pointer patched, on disk and (when loaded)
                // in memory.
                for moved in &sib.children {
                    tx.write_at(moved.off + PARENT_OFF_FIELD, &sib_off.to_be_bytes())?;
                    let loaded = self.pages.lock().get(&moved.off).cloned();
                    if let Some(cell) = loaded {
                        let mut guard = cell.write();
                        let snapshot = guard.kind.clone();
                        let undo_cell = Arc::clone(&cell);
                        ops.on_rollback(move || {
                            undo_cell.write().kind = snapshot;
                        });
                        guard.kind.set_parent_off(sib_off);
                    }
                }
            }
        }

        let left_augment = self.compute_augment(&ctx.guards[child].kind);
        let right_augment = self.compute_augment(&sibling);
        let sib_idx = ctx.add_new_page(sib_off, sibling, &self.pages, ops);

        // Link the sibling into the parent.
        ctx.touch(parent);
        let parent_branch = ctx.guards[parent]
            .kind
            .as_branch_mut()
            .expect("split parent is a branch");
        let ci = parent_branch
            .child_index_of(child_off)
            .ok_or_else(|| Error::Consistency("split child not found in parent".into()))?;
        parent_branch.children[ci].augment = left_augment;
        parent_branch.keys.insert(ci, sep_key.clone());
        parent_branch.children.insert(
            ci + 1,
            ChildRef {
                off: sib_off,
                augment: right_augment,
            },
        );

        debug!("tree: split page {child_off} -> sibling {sib_off}");
        Ok(Split {
            left: child,
            right: sib_idx,
            sep_key,
        })
    }

    fn compute_augment(&self, kind: &PageKind<K, V, A>) -> A {
        match kind {
            PageKind::Leaf(leaf) => leaf
                .slots
                .iter()
                .flatten()
                .fold(A::default(), |acc, e| acc.merge(&A::from_element(&e.key, &e.val))),
            PageKind::Branch(branch) => branch
                .children
                .iter()
                .fold(A::default(), |acc, c| acc.merge(&c.augment)),
        }
    }

    fn insert_into_leaf(
        &self,
        ctx: &mut InsertCtx<K, V, A>,
        leaf_idx: usize,
        key: K,
        make: impl FnOnce() -> Result<(TxAware, V)>,
    ) -> Result<bool> {
        let leaf = ctx.guards[leaf_idx]
            .kind
            .as_leaf()
            .expect("descent ends on a leaf");

        // Position of the successor: the first element not less than
        // the key.
        let succ_pos = leaf
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(e) if e.key >= key))
            .unwrap_or(leaf.slots.len());
        if let Some(Some(existing)) = leaf.slots.get(succ_pos) {
            if existing.key == key {
                return Ok(false);
            }
        }

        // Prefer pulling a null slot forward (shifting the successor
        // run right); fall back to pushing one backward.
        let forward_null = leaf.slots[succ_pos..]
            .iter()
            .position(Option::is_none)
            .map(|i| succ_pos + i);

        ctx.touch(leaf_idx);
        let leaf = ctx.guards[leaf_idx]
            .kind
            .as_leaf_mut()
            .expect("descent ends on a leaf");

        let ins_pos = if let Some(null_at) = forward_null {
            leaf.slots[succ_pos..=null_at].rotate_right(1);
            succ_pos
        } else {
            let ins_pos = succ_pos
                .checked_sub(1)
                .ok_or_else(|| Error::Consistency("no free slot in leaf after split".into()))?;
            let null_at = leaf.slots[..=ins_pos]
                .iter()
                .rposition(Option::is_none)
                .ok_or_else(|| Error::Consistency("no free slot in leaf after split".into()))?;
            leaf.slots[null_at..=ins_pos].rotate_left(1);
            ins_pos
        };
        debug_assert!(leaf.slots[ins_pos].is_none());
        let (stamp, value) = make()?;
        leaf.slots[ins_pos] = Some(Element {
            tx: stamp,
            key,
            val: value,
        });

        self.recompute_spine_augments(ctx);
        Ok(true)
    }

    /// Propagate augments from the modified leaf to the root along the
    /// held spine.
    fn recompute_spine_augments(&self, ctx: &mut InsertCtx<K, V, A>) {
        for level in (1..ctx.spine.len()).rev() {
            let child_idx = ctx.spine[level];
            let parent_idx = ctx.spine[level - 1];

            let child_off = ctx.guards[child_idx].off;
            let augment = self.compute_augment(&ctx.guards[child_idx].kind);

            ctx.touch(parent_idx);
            let parent = ctx.guards[parent_idx]
                .kind
                .as_branch_mut()
                .expect("spine interior pages are branches");
            let ci = parent
                .child_index_of(child_off)
                .expect("spine child is linked into its parent");
            parent.children[ci].augment = augment;
        }
    }

    /// First element in key order, `None` for an empty tree.
    pub fn first(&self) -> Result<Option<(K, V, TxAware)>> {
        let root = self.root.read();
        if *root == 0 {
            return Ok(None);
        }

        let mut cell = self.get_page(*root)?;
        loop {
            let next_off = {
                let page = cell.read();
                match &page.kind {
                    PageKind::Branch(branch) => branch.children[0].off,
                    PageKind::Leaf(leaf) => match leaf.first_occupied() {
                        Some(i) => {
                            let e = leaf.slots[i].as_ref().unwrap();
                            return Ok(Some((e.key.clone(), e.val.clone(), e.tx)));
                        }
                        None => {
                            if leaf.next_off == 0 {
                                return Ok(None);
                            }
                            leaf.next_off
                        }
                    },
                }
            };
            cell = self.get_page(next_off)?;
        }
    }

    /// Last element in key order, `None` for an empty tree.
    pub fn last(&self) -> Result<Option<(K, V, TxAware)>> {
        let root = self.root.read();
        if *root == 0 {
            return Ok(None);
        }

        let mut cell = self.get_page(*root)?;
        loop {
            let next_off = {
                let page = cell.read();
                match &page.kind {
                    PageKind::Branch(branch) => {
                        branch.children.last().expect("branches are never empty").off
                    }
                    PageKind::Leaf(leaf) => match leaf.last_occupied() {
                        Some(i) => {
                            let e = leaf.slots[i].as_ref().unwrap();
                            return Ok(Some((e.key.clone(), e.val.clone(), e.tx)));
                        }
                        None => {
                            if leaf.prev_off == 0 {
                                return Ok(None);
                            }
                            leaf.prev_off
                        }
                    },
                }
            };
            cell = self.get_page(next_off)?;
        }
    }

    /// Visit elements in key order. `reader` filters by snapshot
    /// visibility; `None` sees everything.
    pub fn for_each(
        &self,
        reader: Option<CommitId>,
        mut cb: impl FnMut(&K, &V, &TxAware) -> ControlFlow<()>,
    ) -> Result<()> {
        let root = self.root.read();
        if *root == 0 {
            return Ok(());
        }

        let mut leaf_off = self.leftmost_leaf(*root)?;
        loop {
            let next = {
                let page = self.get_page(leaf_off)?;
                let page = page.read();
                let leaf = page.kind.as_leaf().expect("leaf chain holds leaves");
                for e in leaf.slots.iter().flatten() {
                    if reader.map_or(true, |r| e.tx.is_visible_to(r)) {
                        if cb(&e.key, &e.val, &e.tx).is_break() {
                            return Ok(());
                        }
                    }
                }
                leaf.next_off
            };
            if next == 0 {
                return Ok(());
            }
            leaf_off = next;
        }
    }

    fn leftmost_leaf(&self, from: u64) -> Result<u64> {
        let mut off = from;
        loop {
            let cell = self.get_page(off)?;
            let page = cell.read();
            match &page.kind {
                PageKind::Branch(branch) => off = branch.children[0].off,
                PageKind::Leaf(_) => return Ok(off),
            }
        }
    }

    /// Visit elements whose key equals `key`, in order.
    pub fn for_each_equal(
        &self,
        key: &K,
        reader: Option<CommitId>,
        mut cb: impl FnMut(&K, &V, &TxAware) -> ControlFlow<()>,
    ) -> Result<()> {
        let root = self.root.read();
        if *root == 0 {
            return Ok(());
        }

        // Descend by key.
        let mut leaf_off = {
            let mut off = *root;
            loop {
                let cell = self.get_page(off)?;
                let page = cell.read();
                match &page.kind {
                    PageKind::Branch(branch) => off = branch.children[branch.search_child(key)].off,
                    PageKind::Leaf(_) => break off,
                }
            }
        };

        // Enumerate leaves forward until past the equal run.
        loop {
            let next = {
                let page = self.get_page(leaf_off)?;
                let page = page.read();
                let leaf = page.kind.as_leaf().expect("leaf chain holds leaves");
                for e in leaf.slots.iter().flatten() {
                    if e.key > *key {
                        return Ok(());
                    }
                    if e.key == *key
                        && reader.map_or(true, |r| e.tx.is_visible_to(r))
                        && cb(&e.key, &e.val, &e.tx).is_break()
                    {
                        return Ok(());
                    }
                }
                leaf.next_off
            };
            if next == 0 {
                return Ok(());
            }
            leaf_off = next;
        }
    }

    /// Visit elements in key order, skipping whole subtrees whose
    /// augment fails `filter`.
    pub fn for_each_augment(
        &self,
        filter: &mut impl FnMut(&A) -> bool,
        reader: Option<CommitId>,
        cb: &mut impl FnMut(&K, &V, &TxAware) -> ControlFlow<()>,
    ) -> Result<()> {
        let root = self.root.read();
        if *root == 0 {
            return Ok(());
        }
        self.for_each_augment_at(*root, filter, reader, cb)
            .map(|_| ())
    }

    fn for_each_augment_at(
        &self,
        off: u64,
        filter: &mut impl FnMut(&A) -> bool,
        reader: Option<CommitId>,
        cb: &mut impl FnMut(&K, &V, &TxAware) -> ControlFlow<()>,
    ) -> Result<ControlFlow<()>> {
        let cell = self.get_page(off)?;

        // Snapshot the surviving child list: recursing while holding
        // the page lock would pin a read lock over arbitrary subtree
        // work.
        let children: Vec<u64> = {
            let page = cell.read();
            match &page.kind {
                PageKind::Leaf(leaf) => {
                    for e in leaf.slots.iter().flatten() {
                        if reader.map_or(true, |r| e.tx.is_visible_to(r)) {
                            if cb(&e.key, &e.val, &e.tx).is_break() {
                                return Ok(ControlFlow::Break(()));
                            }
                        }
                    }
                    return Ok(ControlFlow::Continue(()));
                }
                PageKind::Branch(branch) => branch
                    .children
                    .iter()
                    .filter(|c| filter(&c.augment))
                    .map(|c| c.off)
                    .collect(),
            }
        };

        for child in children {
            if self
                .for_each_augment_at(child, filter, reader, cb)?
                .is_break()
            {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Validate the persisted tree against its structural invariants,
    /// decoding every page from the file (the in-memory page table is
    /// not consulted).
    pub fn check_consistency(&self) -> Result<()>
    where
        A: PartialEq + std::fmt::Debug,
    {
        let root = self.root.read();
        let tx = self.file.begin(true)?;
        if *root == 0 {
            return Ok(());
        }

        let mut leaves = Vec::new();
        self.check_page(&tx, *root, 0, None, None, &mut leaves)?;

        // The leaf chain must link exactly the in-order leaves.
        for (i, leaf) in leaves.iter().enumerate() {
            let want_prev = if i == 0 { 0 } else { leaves[i - 1].off };
            let want_next = if i + 1 == leaves.len() { 0 } else { leaves[i + 1].off };
            if leaf.prev_off != want_prev || leaf.next_off != want_next {
                return Err(Error::Consistency(format!(
                    "leaf {} has links prev={} next={}, want prev={} next={}",
                    leaf.off, leaf.prev_off, leaf.next_off, want_prev, want_next,
                )));
            }
        }
        Ok(())
    }

    fn check_page(
        &self,
        tx: &Transaction,
        off: u64,
        expect_parent: u64,
        lower: Option<&K>,
        upper: Option<&K>,
        leaves: &mut Vec<LeafLink>,
    ) -> Result<A>
    where
        A: PartialEq + std::fmt::Debug,
    {
        let mut buf = vec![0u8; self.max_page_size()];
        read_prefix(tx, off, &mut buf)?;
        let kind: PageKind<K, V, A> = PageKind::decode(&buf, &self.cfg)?;

        if kind.parent_off() != expect_parent {
            return Err(Error::Consistency(format!(
                "page {off} has parent {} but is referenced from {expect_parent}",
                kind.parent_off(),
            )));
        }

        match kind {
            PageKind::Leaf(leaf) => {
                if leaf.page_key.as_ref() != lower {
                    return Err(Error::Consistency(format!(
                        "leaf {off} page key does not match its lower bound",
                    )));
                }
                let mut prev: Option<&K> = None;
                for e in leaf.slots.iter().flatten() {
                    if prev.is_some_and(|p| *p >= e.key) {
                        return Err(Error::Consistency(format!(
                            "leaf {off} elements out of order",
                        )));
                    }
                    if lower.is_some_and(|l| e.key < *l) || upper.is_some_and(|u| e.key >= *u) {
                        return Err(Error::Consistency(format!(
                            "leaf {off} element outside its separator bounds",
                        )));
                    }
                    prev = Some(&e.key);
                }
                let augment = self.compute_augment(&PageKind::Leaf(leaf.clone()));
                leaves.push(LeafLink {
                    off,
                    next_off: leaf.next_off,
                    prev_off: leaf.prev_off,
                });
                Ok(augment)
            }
            PageKind::Branch(branch) => {
                if branch.children.is_empty() {
                    return Err(Error::Consistency(format!("branch {off} is empty")));
                }
                for pair in branch.keys.windows(2) {
                    if pair[0] >= pair[1] {
                        return Err(Error::Consistency(format!(
                            "branch {off} separators out of order",
                        )));
                    }
                }

                let mut total = A::default();
                for (i, child) in branch.children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(&branch.keys[i - 1]) };
                    let child_upper = if i == branch.keys.len() {
                        upper
                    } else {
                        Some(&branch.keys[i])
                    };
                    let child_augment =
                        self.check_page(tx, child.off, off, child_lower, child_upper, leaves)?;
                    if child_augment != child.augment {
                        return Err(Error::Consistency(format!(
                            "branch {off} child {} augment {:?} does not summarize subtree {:?}",
                            child.off, child.augment, child_augment,
                        )));
                    }
                    total = total.merge(&child_augment);
                }
                Ok(total)
            }
        }
    }
}

struct LeafLink {
    off: u64,
    next_off: u64,
    prev_off: u64,
}

/// Result of a page split: guard indexes of both halves and the
/// separator between them.
struct Split<K> {
    left: usize,
    right: usize,
    sep_key: K,
}

impl<K: Ord> Split<K> {
    fn pick(&self, key: &K) -> usize {
        if *key < self.sep_key {
            self.left
        } else {
            self.right
        }
    }
}

/// Per-insert bookkeeping: held page guards, the root-to-leaf spine,
/// dirty tracking and rollback snapshots for pages we hold locks on.
/// Pages touched without a held lock roll back through the
/// [`TxOpCollection`] instead.
struct InsertCtx<K, V, A> {
    guards: Vec<PageWriteGuard<K, V, A>>,
    /// Guard indexes from root to leaf.
    spine: Vec<usize>,
    dirty: BTreeSet<usize>,
    is_new: Vec<bool>,
    undo_pages: Vec<(usize, PageKind<K, V, A>)>,
}

impl<K, V, A> InsertCtx<K, V, A>
where
    K: TreeKey,
    V: TreeValue,
    A: TreeAugment<K, V>,
{
    fn new() -> Self {
        InsertCtx {
            guards: Vec::new(),
            spine: Vec::new(),
            dirty: BTreeSet::new(),
            is_new: Vec::new(),
            undo_pages: Vec::new(),
        }
    }

    fn push_guard(&mut self, cell: PageCell<K, V, A>) -> usize {
        self.guards.push(cell.write_arc());
        self.is_new.push(false);
        self.guards.len() - 1
    }

    fn index_of(&self, off: u64) -> Option<usize> {
        self.guards.iter().position(|g| g.off == off)
    }

    /// Create a page. It enters the tree's page table only through the
    /// registered on-commit closure; until then it is reachable solely
    /// through this context.
    fn add_new_page(
        &mut self,
        off: u64,
        kind: PageKind<K, V, A>,
        pages: &PageTable<K, V, A>,
        ops: &mut TxOpCollection,
    ) -> usize {
        let cell = Arc::new(RwLock::new(PageBuf { off, kind }));
        let table = Arc::clone(pages);
        let registered = Arc::clone(&cell);
        ops.on_commit(move || {
            table.lock().insert(off, registered);
        });

        self.guards.push(cell.write_arc());
        self.is_new.push(true);
        self.dirty.insert(self.guards.len() - 1);
        self.guards.len() - 1
    }

    /// Mark a page dirty, snapshotting it for rollback on first touch.
    fn touch(&mut self, idx: usize) {
        if self.dirty.insert(idx) && !self.is_new[idx] {
            self.undo_pages.push((idx, self.guards[idx].kind.clone()));
        }
    }
}

/// Read up to `buf.len()` bytes at `off`, zero-filling past the
/// logical end. Pages at the end of the file may be shorter than the
/// largest page type.
fn read_prefix(tx: &Transaction, mut off: u64, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        match tx.read_at(off, buf)? {
            0 => {
                buf.fill(0);
                return Ok(());
            }
            n => {
                off += n as u64;
                buf = &mut buf[n..];
            }
        }
    }
    Ok(())
}
