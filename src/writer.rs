//! The writer (component C3): owns the currently-active generation file.
//!
//! All "offset" quantities tracked here — `write_offset`, `last_synced_offset`,
//! and the `offset` a [`Location`] carries — are measured from the first byte
//! *after* the file header, not from the start of the file. The header is a
//! fixed, one-time cost paid when the generation is created; everything else
//! in this module only ever deals with the data region that follows it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};

use crate::checkpoint::{self, Checkpoint, CheckpointError, CreateMode};
use crate::generation::{live_checkpoint_path, tlog_path};
use crate::header;
use crate::location::Location;
use crate::operation::{encode_operation, Operation};
use crate::reader::Reader;
use crate::{Generation, TlogUuid};

/// A global-checkpoint watermark supplier, called each time the live
/// checkpoint is rewritten. Treated as advisory per spec §9: whatever value
/// it returns is recorded alongside `offset`, but it is `offset` (and the
/// data it names being durable) that recovery actually depends on.
pub type GlobalCheckpointSupplier = Arc<dyn Fn() -> i64 + Send + Sync>;

/// A fatal I/O error captured by a writer. Kept behind an `Arc` so every
/// subsequent [`WriterError::AlreadyClosed`] can cite the same root cause
/// without cloning the underlying [`io::Error`].
#[derive(Debug, Clone)]
pub struct TragicCause(pub Arc<io::Error>);

impl std::fmt::Display for TragicCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error that occurred during a [`Writer`] operation.
#[derive(Debug, Snafu)]
pub enum WriterError {
    #[snafu(display("write I/O error: {source}"))]
    Io { source: io::Error },

    /// The writer has been closed, either because it was sealed into a
    /// reader, or because an earlier I/O error was fatal. When `cause` is
    /// present, it is the root [`io::Error`] that forced the close.
    #[snafu(display("writer already closed{}", cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default()))]
    AlreadyClosed { cause: Option<TragicCause> },

    #[snafu(display("failed to persist checkpoint: {source}"))]
    Checkpoint { source: CheckpointError },
}

impl From<io::Error> for WriterError {
    fn from(source: io::Error) -> Self {
        WriterError::Io { source }
    }
}

struct Inner {
    file: File,
    buffer: Vec<u8>,
    write_offset: u64,
    last_synced_offset: u64,
    ever_synced: bool,
    num_ops_written: u64,
    tragic: Option<Arc<io::Error>>,
    sealed: bool,
}

impl Inner {
    fn fail(&mut self, err: io::Error) -> WriterError {
        let arc = Arc::new(err);
        self.tragic = Some(Arc::clone(&arc));
        WriterError::Io {
            source: io::Error::new(arc.kind(), arc.to_string()),
        }
    }

    fn check_open(&self) -> Result<(), WriterError> {
        if let Some(cause) = &self.tragic {
            return Err(WriterError::AlreadyClosed {
                cause: Some(TragicCause(Arc::clone(cause))),
            });
        }
        if self.sealed {
            return Err(WriterError::AlreadyClosed { cause: None });
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }
}

/// Owns the generation file currently accepting appends.
pub struct Writer {
    dir: PathBuf,
    uuid: TlogUuid,
    generation: Generation,
    write_buffer_size: usize,
    fsync_on_every_append: bool,
    global_checkpoint_supplier: GlobalCheckpointSupplier,
    inner: Mutex<Inner>,
}

impl Writer {
    /// Creates generation `generation`'s file, writes its header, and
    /// returns a [`Writer`] ready to accept appends at offset zero.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::Io`] if the file cannot be created or the
    /// header cannot be written.
    #[instrument(skip(global_checkpoint_supplier), level = "debug")]
    pub fn create_new(
        dir: PathBuf,
        uuid: TlogUuid,
        generation: Generation,
        write_buffer_size: usize,
        fsync_on_every_append: bool,
        global_checkpoint_supplier: GlobalCheckpointSupplier,
    ) -> Result<Self, WriterError> {
        let path = tlog_path(&dir, generation);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;
        header::write(&mut file, uuid).map_err(|err| match err {
            header::HeaderError::Io { source } => WriterError::Io { source },
            other => WriterError::Io {
                source: io::Error::other(other.to_string()),
            },
        })?;
        file.sync_all()?;

        debug!(generation, path = %path.display(), "created new generation");

        Ok(Self {
            dir,
            uuid,
            generation,
            write_buffer_size,
            fsync_on_every_append,
            global_checkpoint_supplier,
            inner: Mutex::new(Inner {
                file,
                buffer: Vec::with_capacity(write_buffer_size),
                write_offset: 0,
                last_synced_offset: 0,
                ever_synced: false,
                num_ops_written: 0,
                tragic: None,
                sealed: false,
            }),
        })
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Bytes currently durable on disk for this generation.
    #[must_use]
    pub fn last_synced_offset(&self) -> u64 {
        self.inner.lock().last_synced_offset
    }

    /// Total bytes appended so far (buffered or durable).
    #[must_use]
    pub fn write_offset(&self) -> u64 {
        self.inner.lock().write_offset
    }

    #[must_use]
    pub fn num_ops_written(&self) -> u64 {
        self.inner.lock().num_ops_written
    }

    /// Encodes and appends `op`, returning its [`Location`].
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::AlreadyClosed`] if the writer has already been
    /// sealed or has a recorded fatal error. Returns [`WriterError::Io`] if
    /// `fsync_on_every_append` is set and the forced flush fails; in that
    /// case the writer is marked fatally closed before the error is
    /// returned.
    #[instrument(skip(self, op), level = "trace")]
    pub fn append(&self, op: &Operation) -> Result<Location, WriterError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let body = encode_operation(op);
        let frame_len = body.len() as u64;
        let offset_before = inner.write_offset;

        inner.buffer.extend_from_slice(&(body.len() as u32).to_le_bytes());
        inner.buffer.extend_from_slice(&body);
        inner.write_offset += 4 + frame_len;
        inner.num_ops_written += 1;

        if inner.buffer.len() >= self.write_buffer_size {
            if let Err(err) = inner.flush_buffer() {
                return Err(inner.fail(err));
            }
        }

        if self.fsync_on_every_append {
            let target = inner.write_offset;
            drop(inner);
            self.sync_up_to(target)?;
        }

        Ok(Location::new(self.generation, offset_before, 4 + frame_len))
    }

    /// Ensures at least `min_offset` bytes are durable, rewriting the live
    /// checkpoint if a new fsync actually occurred.
    ///
    /// The first call on a freshly created writer always performs the
    /// flush/fsync/checkpoint sequence, even when `min_offset` is zero: this
    /// is what lets a writer's first act, post-rotation, be to point the live
    /// checkpoint at its own generation rather than leave it naming the
    /// sealed one. Later calls return `Ok(false)` if `min_offset` was already
    /// covered by a prior sync (this call's own, or one a concurrent caller
    /// already performed); `Ok(true)` if this call itself performed the
    /// sequence.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::AlreadyClosed`] if the writer is closed.
    /// Returns [`WriterError::Io`]/[`WriterError::Checkpoint`] if the flush,
    /// fsync, or checkpoint rewrite fails; in all three cases the writer is
    /// marked fatally closed.
    #[instrument(skip(self), level = "debug")]
    pub fn sync_up_to(&self, min_offset: u64) -> Result<bool, WriterError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        if inner.ever_synced && inner.last_synced_offset >= min_offset {
            return Ok(false);
        }

        if let Err(err) = inner.flush_buffer() {
            return Err(inner.fail(err));
        }
        if let Err(err) = inner.file.sync_all() {
            return Err(inner.fail(err));
        }

        let synced_offset = inner.write_offset;
        let ops_count = inner.num_ops_written;

        let checkpoint = Checkpoint {
            ops_count: u32::try_from(ops_count).unwrap_or(u32::MAX),
            offset: synced_offset,
            generation: self.generation,
            global_checkpoint: (self.global_checkpoint_supplier)(),
        };

        let live_path = live_checkpoint_path(&self.dir);
        if let Err(err) = checkpoint::write(&live_path, checkpoint, CreateMode::Overwrite) {
            let io_err = match err {
                CheckpointError::Io { source } => source,
                CheckpointError::Corruption { reason } => io::Error::other(reason),
            };
            return Err(inner.fail(io_err));
        }

        inner.last_synced_offset = synced_offset;
        inner.ever_synced = true;
        trace!(generation = self.generation, synced_offset, "synced generation");
        Ok(true)
    }

    /// Equivalent to `sync_up_to(write_offset())`.
    ///
    /// # Errors
    ///
    /// See [`Writer::sync_up_to`].
    pub fn sync(&self) -> Result<bool, WriterError> {
        let target = self.inner.lock().write_offset;
        self.sync_up_to(target)
    }

    /// Produces a lazy iterator over everything appended so far, including
    /// operations buffered in memory but not yet fsynced. Used by
    /// [`Tlog::new_snapshot`](crate::controller::Tlog::new_snapshot) to cover
    /// the writer's reachable tail alongside the sealed readers.
    ///
    /// The returned iterator does not observe operations appended after this
    /// call returns, matching the spec's snapshot-isolation contract.
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::AlreadyClosed`] if the writer is closed, or
    /// [`WriterError::Io`] if flushing the in-memory buffer to the OS fails.
    pub fn new_snapshot_of_tail(&self) -> Result<(u64, crate::reader::OperationIterator), WriterError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if let Err(err) = inner.flush_buffer() {
            return Err(inner.fail(err));
        }
        let write_offset = inner.write_offset;
        let num_ops = inner.num_ops_written;
        drop(inner);

        let path = tlog_path(&self.dir, self.generation);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(header::HEADER_LEN))?;
        let iter = crate::reader::OperationIterator::new(file.take(write_offset));
        Ok((num_ops, iter))
    }

    /// Flushes, fsyncs, closes the write handle, and returns a [`Reader`]
    /// over the same generation. Subsequent calls on `self` fail with
    /// [`WriterError::AlreadyClosed`].
    ///
    /// # Errors
    ///
    /// Returns [`WriterError::Io`] if the final flush/fsync fails or the
    /// file cannot be reopened for reading.
    #[instrument(skip(self), level = "debug")]
    pub fn close_into_reader(&self) -> Result<Reader, WriterError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        if let Err(err) = inner.flush_buffer() {
            return Err(inner.fail(err));
        }
        if let Err(err) = inner.file.sync_all() {
            return Err(inner.fail(err));
        }

        inner.sealed = true;
        let size_in_bytes = inner.write_offset;
        let operations_count = inner.num_ops_written;

        let path = tlog_path(&self.dir, self.generation);
        let read_handle = File::open(&path)?;

        debug!(generation = self.generation, size_in_bytes, "sealed writer into reader");

        Ok(Reader::from_parts(
            self.generation,
            read_handle,
            self.uuid,
            operations_count,
            size_in_bytes,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{NoOpOperation, Operation};

    fn no_op(seq_no: i64) -> Operation {
        Operation::NoOp(NoOpOperation {
            seq_no,
            primary_term: 1,
            reason: "test".to_string(),
        })
    }

    fn gcp_supplier() -> GlobalCheckpointSupplier {
        Arc::new(|| 0)
    }

    #[test]
    fn append_returns_increasing_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::create_new(
            dir.path().to_path_buf(),
            TlogUuid::new_random(),
            1,
            crate::config::DEFAULT_WRITE_BUFFER_SIZE,
            false,
            gcp_supplier(),
        )
        .unwrap();

        let loc1 = writer.append(&no_op(1)).unwrap();
        let loc2 = writer.append(&no_op(2)).unwrap();
        assert_eq!(loc1.generation, 1);
        assert_eq!(loc2.generation, 1);
        assert!(loc2.offset > loc1.offset);
        assert_eq!(loc1.offset, 0);
    }

    #[test]
    fn sync_is_a_no_op_when_already_covered() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::create_new(
            dir.path().to_path_buf(),
            TlogUuid::new_random(),
            1,
            crate::config::DEFAULT_WRITE_BUFFER_SIZE,
            false,
            gcp_supplier(),
        )
        .unwrap();

        writer.append(&no_op(1)).unwrap();
        assert!(writer.sync().unwrap());
        assert!(!writer.sync().unwrap());
    }

    #[test]
    fn sync_writes_a_readable_live_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::create_new(
            dir.path().to_path_buf(),
            TlogUuid::new_random(),
            1,
            crate::config::DEFAULT_WRITE_BUFFER_SIZE,
            false,
            gcp_supplier(),
        )
        .unwrap();
        writer.append(&no_op(1)).unwrap();
        writer.sync().unwrap();

        let ckp = checkpoint::read(&live_checkpoint_path(dir.path())).unwrap();
        assert_eq!(ckp.generation, 1);
        assert_eq!(ckp.ops_count, 1);
        assert_eq!(ckp.offset, writer.write_offset());
    }

    #[test]
    fn append_after_seal_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::create_new(
            dir.path().to_path_buf(),
            TlogUuid::new_random(),
            1,
            crate::config::DEFAULT_WRITE_BUFFER_SIZE,
            false,
            gcp_supplier(),
        )
        .unwrap();
        writer.append(&no_op(1)).unwrap();
        let _reader = writer.close_into_reader().unwrap();

        let err = writer.append(&no_op(2)).unwrap_err();
        assert!(matches!(err, WriterError::AlreadyClosed { .. }));
    }

    #[test]
    fn sealed_reader_sees_every_appended_operation() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::create_new(
            dir.path().to_path_buf(),
            TlogUuid::new_random(),
            1,
            crate::config::DEFAULT_WRITE_BUFFER_SIZE,
            false,
            gcp_supplier(),
        )
        .unwrap();
        for i in 0..5 {
            writer.append(&no_op(i)).unwrap();
        }
        let reader = writer.close_into_reader().unwrap();
        assert_eq!(reader.total_operations(), 5);

        let ops: Vec<_> = reader
            .new_snapshot()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(ops.len(), 5);
    }
}
