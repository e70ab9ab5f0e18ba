//! The snapshot (component C5): a point-in-time iterator over the log's
//! current contents.

use std::collections::VecDeque;

use snafu::Snafu;

use crate::reader::{OperationIterator, ReaderError};
use crate::Operation;

/// Error surfaced while iterating a [`Snapshot`].
#[derive(Debug, Snafu)]
pub enum SnapshotError {
    #[snafu(display("{source}"))]
    Reader { source: ReaderError },
}

impl From<ReaderError> for SnapshotError {
    fn from(source: ReaderError) -> Self {
        SnapshotError::Reader { source }
    }
}

/// A frozen set of per-generation operation iterators, concatenated in
/// generation order: one sealed reader per retained generation, plus the
/// current writer's readable tail as of the moment the snapshot was formed.
///
/// A snapshot does not observe operations appended to the writer after its
/// construction, and it is safe to iterate concurrently with further
/// appends to the owning [`Tlog`](crate::controller::Tlog).
pub struct Snapshot {
    total_operations: u64,
    parts: VecDeque<OperationIterator>,
}

impl Snapshot {
    /// Builds a snapshot from its constituent per-generation iterators, in
    /// the order they should be read (ascending generation, tail last).
    pub(crate) fn from_parts(parts: Vec<(u64, OperationIterator)>) -> Self {
        let total_operations = parts.iter().map(|(count, _)| count).sum();
        Self {
            total_operations,
            parts: parts.into_iter().map(|(_, iter)| iter).collect(),
        }
    }

    /// Sum of the per-generation operation counts at snapshot construction
    /// time.
    #[must_use]
    pub fn total_operations(&self) -> u64 {
        self.total_operations
    }

    /// Returns the next operation, or `None` once every underlying reader
    /// and the writer's tail have been exhausted.
    pub fn next(&mut self) -> Option<Result<Operation, SnapshotError>> {
        <Self as Iterator>::next(self)
    }
}

impl Iterator for Snapshot {
    type Item = Result<Operation, SnapshotError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let front = self.parts.front_mut()?;
            match front.next() {
                Some(item) => return Some(item.map_err(SnapshotError::from)),
                None => {
                    self.parts.pop_front();
                }
            }
        }
    }
}
