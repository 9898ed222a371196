/// A registry of deferred in-memory effects tied to one txfile
/// transaction.
///
/// Structural tree operations stage their on-disk writes into a
/// transaction and describe the matching in-memory changes here:
/// `on_commit` closures run (in registration order) once the
/// transaction committed, `on_rollback` closures run (in reverse
/// order) when the collection is dropped without [`commit`] — the
/// scope-exit path of a failed operation.
///
/// [`commit`]: TxOpCollection::commit
#[derive(Default)]
pub struct TxOpCollection {
    on_commit: Vec<Box<dyn FnOnce() + Send>>,
    on_rollback: Vec<Box<dyn FnOnce() + Send>>,
    committed: bool,
}

impl TxOpCollection {
    pub fn new() -> Self {
        TxOpCollection::default()
    }

    pub fn on_commit(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(f));
    }

    pub fn on_rollback(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_rollback.push(Box::new(f));
    }

    /// Run the commit closures and disarm the rollback ones. Must only
    /// be called after the underlying transaction committed; never
    /// fails.
    pub fn commit(mut self) {
        self.committed = true;
        self.on_rollback.clear();
        for f in std::mem::take(&mut self.on_commit) {
            f();
        }
    }
}

impl Drop for TxOpCollection {
    fn drop(&mut self) {
        if !self.committed {
            // Revert in reverse registration order.
            while let Some(f) = self.on_rollback.pop() {
                f();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn commit_runs_commit_closures_only() {
        let committed = Arc::new(AtomicUsize::new(0));
        let rolled_back = Arc::new(AtomicUsize::new(0));

        let mut ops = TxOpCollection::new();
        let c = Arc::clone(&committed);
        ops.on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let r = Arc::clone(&rolled_back);
        ops.on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        ops.commit();
        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_runs_rollback_closures_in_reverse() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        {
            let mut ops = TxOpCollection::new();
            for i in 0..3 {
                let order = Arc::clone(&order);
                ops.on_rollback(move || order.lock().unwrap().push(i));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }
}
