/// Geometry of a tree: how many slots its pages carry.
///
/// The byte widths of keys, values and augments come from their
/// [`crate::FixedCodec`] impls; together with this config they fix the
/// on-disk page sizes, so a tree must always be opened with the config
/// it was created with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TreeCfg {
    /// Element slots per leaf page.
    pub items_per_leaf_page: usize,
    /// Child entries per branch page.
    pub items_per_node_page: usize,
}

impl TreeCfg {
    pub fn new(items_per_leaf_page: usize, items_per_node_page: usize) -> Self {
        assert!(items_per_leaf_page >= 2, "leaf pages need at least 2 slots");
        assert!(items_per_node_page >= 3, "branch pages need at least 3 slots");
        TreeCfg {
            items_per_leaf_page,
            items_per_node_page,
        }
    }
}

impl Default for TreeCfg {
    fn default() -> Self {
        TreeCfg::new(64, 64)
    }
}
