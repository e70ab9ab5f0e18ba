//! The view (component C6): a named handle pinning retention of older
//! generations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::controller::{ControllerError, Inner};
use crate::snapshot::Snapshot;
use crate::Generation;

/// Pins every generation `>= min_generation()` against trimming until
/// [`View::close`] is called (or the view is dropped).
///
/// Views are the only mechanism that holds a reader past a commit: without
/// one, `trim_unreferenced_readers` is free to unlink any generation below
/// `last_committed_generation` the moment it runs.
pub struct View {
    id: u64,
    min_generation: Generation,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl View {
    pub(crate) fn new(id: u64, min_generation: Generation, inner: Arc<Inner>) -> Self {
        Self {
            id,
            min_generation,
            inner,
            closed: AtomicBool::new(false),
        }
    }

    /// The generation captured as `last_committed_generation` when this view
    /// was created; the view guarantees every generation at or above this
    /// one survives until it is closed.
    #[must_use]
    pub fn min_generation(&self) -> Generation {
        self.min_generation
    }

    /// A snapshot covering every generation `>= min_generation()`, including
    /// the writer's current tail.
    ///
    /// # Errors
    ///
    /// See [`Tlog::new_snapshot`](crate::controller::Tlog::new_snapshot).
    pub fn snapshot(&self) -> Result<Snapshot, ControllerError> {
        self.inner.new_snapshot_from(self.min_generation)
    }

    /// Unregisters this view and runs a trim pass. Idempotent: closing an
    /// already-closed view is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.unregister_view(self.id);
        self.inner.trim_unreferenced_readers();
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlogConfigBuilder;
    use crate::controller::Tlog;
    use crate::operation::{NoOpOperation, Operation};

    fn no_op(seq_no: i64) -> Operation {
        Operation::NoOp(NoOpOperation {
            seq_no,
            primary_term: 1,
            reason: "r".to_string(),
        })
    }

    #[test]
    fn view_pins_retention_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let config = TlogConfigBuilder::from_path(dir.path()).build().unwrap();
        let tlog = Tlog::open(config, None, Arc::new(|| -2)).unwrap();

        for i in 0..5 {
            tlog.append(&no_op(i)).unwrap();
        }
        let view = tlog.new_view();
        tlog.prepare_commit().unwrap();
        tlog.commit().unwrap();

        let gen1_path = crate::generation::tlog_path(dir.path(), 1);
        assert!(gen1_path.exists(), "view should keep generation 1 alive");

        view.close();
        assert!(!gen1_path.exists(), "closing the view should allow generation 1 to be trimmed");
    }

    #[test]
    fn double_close_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = TlogConfigBuilder::from_path(dir.path()).build().unwrap();
        let tlog = Tlog::open(config, None, Arc::new(|| -2)).unwrap();
        let view = tlog.new_view();
        view.close();
        view.close();
    }
}
