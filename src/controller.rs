//! The log controller (component C7): orchestrates open/recover, append,
//! sync, rotation, retention, and close, and enforces the concurrency
//! discipline around the reader list.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use snafu::Snafu;

use crate::checkpoint::{self, Checkpoint, CheckpointError, CreateMode};
use crate::config::Durability;
use crate::generation::{fsync_directory, live_checkpoint_path, sealed_checkpoint_path, tlog_path};
use crate::location::{max_location, Location};
use crate::operation::Operation;
use crate::reader::{Reader, ReaderError};
use crate::recovery::{self, RecoveryError};
use crate::snapshot::Snapshot;
use crate::view::View;
use crate::writer::{GlobalCheckpointSupplier, Writer, WriterError};
use crate::{Generation, TlogConfig, TlogUuid};

/// Error returned by any [`Tlog`] operation.
#[derive(Debug, Snafu)]
pub enum ControllerError {
    #[snafu(display("controller I/O error: {source}"))]
    Io { source: io::Error },

    #[snafu(display("{source}"))]
    Writer { source: WriterError },

    #[snafu(display("{source}"))]
    Reader { source: ReaderError },

    #[snafu(display("{source}"))]
    Checkpoint { source: CheckpointError },

    #[snafu(display("{source}"))]
    Snapshot { source: crate::snapshot::SnapshotError },

    #[snafu(display("{source}"))]
    Recovery { source: RecoveryError },

    #[snafu(display("tlog is already closed"))]
    AlreadyClosed,

    #[snafu(display("illegal state: {reason}"))]
    IllegalState { reason: String },
}

impl From<io::Error> for ControllerError {
    fn from(source: io::Error) -> Self {
        ControllerError::Io { source }
    }
}

impl From<WriterError> for ControllerError {
    fn from(source: WriterError) -> Self {
        ControllerError::Writer { source }
    }
}

impl From<ReaderError> for ControllerError {
    fn from(source: ReaderError) -> Self {
        ControllerError::Reader { source }
    }
}

impl From<CheckpointError> for ControllerError {
    fn from(source: CheckpointError) -> Self {
        ControllerError::Checkpoint { source }
    }
}

impl From<crate::snapshot::SnapshotError> for ControllerError {
    fn from(source: crate::snapshot::SnapshotError) -> Self {
        ControllerError::Snapshot { source }
    }
}

impl From<RecoveryError> for ControllerError {
    fn from(source: RecoveryError) -> Self {
        ControllerError::Recovery { source }
    }
}

/// A point-in-time summary of the log's size and commit state, intended for
/// operational introspection rather than the append/sync hot path.
#[derive(Debug, Clone, Serialize)]
pub struct TranslogStats {
    pub current_generation: Generation,
    pub num_operations: u64,
    pub uncommitted_operations: u64,
    pub uncommitted_size_in_bytes: u64,
    pub earliest_last_modified_age_secs: u64,
}

/// Mutable state protected by the controller's readers-writer lock: the
/// active writer, the ordered reader list, and the rotation bookkeeping.
struct State {
    writer: Writer,
    /// Ascending by generation; consecutive, with no gap before `writer`.
    readers: Vec<Reader>,
    last_committed_generation: Option<Generation>,
    current_committing_generation: Option<Generation>,
}

/// Shared controller state. Kept separate from [`Tlog`] so that [`View`] can
/// hold a strong reference back to it without exposing `Tlog` itself as
/// `Clone`.
pub(crate) struct Inner {
    dir: PathBuf,
    uuid: TlogUuid,
    config: TlogConfig,
    gcp_supplier: GlobalCheckpointSupplier,
    state: RwLock<State>,
    views: Mutex<std::collections::HashMap<u64, Generation>>,
    next_view_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn mark_tragic(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn check_open(&self) -> Result<(), ControllerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ControllerError::AlreadyClosed);
        }
        Ok(())
    }

    pub(crate) fn append(&self, op: &Operation) -> Result<Location, ControllerError> {
        self.check_open()?;
        let state = self.state.read();
        let loc = match state.writer.append(op) {
            Ok(loc) => loc,
            Err(err) => {
                if matches!(err, WriterError::Io { .. } | WriterError::Checkpoint { .. }) {
                    self.mark_tragic();
                }
                return Err(err.into());
            }
        };

        if self.config.durability() == Durability::Request {
            let target = loc.offset + loc.size;
            if let Err(err) = state.writer.sync_up_to(target) {
                if matches!(err, WriterError::Io { .. } | WriterError::Checkpoint { .. }) {
                    self.mark_tragic();
                }
                return Err(err.into());
            }
        }

        Ok(loc)
    }

    pub(crate) fn ensure_synced(&self, location: Location) -> Result<bool, ControllerError> {
        self.check_open()?;
        let state = self.state.read();
        if location.generation < state.writer.generation() {
            // Already sealed (and fsynced, per the rotation protocol) during
            // a prior prepare_commit.
            return Ok(false);
        }
        let target = location.offset + location.size;
        match state.writer.sync_up_to(target) {
            Ok(did_sync) => Ok(did_sync),
            Err(err) => {
                if matches!(err, WriterError::Io { .. } | WriterError::Checkpoint { .. }) {
                    self.mark_tragic();
                }
                Err(err.into())
            }
        }
    }

    pub(crate) fn ensure_synced_all<I>(&self, locations: I) -> Result<bool, ControllerError>
    where
        I: IntoIterator<Item = Location>,
    {
        match max_location(locations) {
            Some(loc) => self.ensure_synced(loc),
            None => Ok(false),
        }
    }

    pub(crate) fn sync(&self) -> Result<bool, ControllerError> {
        self.check_open()?;
        let state = self.state.read();
        match state.writer.sync() {
            Ok(did_sync) => Ok(did_sync),
            Err(err) => {
                if matches!(err, WriterError::Io { .. } | WriterError::Checkpoint { .. }) {
                    self.mark_tragic();
                }
                Err(err.into())
            }
        }
    }

    pub(crate) fn last_synced_global_checkpoint(&self) -> Result<i64, ControllerError> {
        self.check_open()?;
        Ok(checkpoint::read(&live_checkpoint_path(&self.dir))?.global_checkpoint)
    }

    pub(crate) fn new_snapshot(&self) -> Result<Snapshot, ControllerError> {
        self.new_snapshot_from(0)
    }

    pub(crate) fn new_snapshot_from(&self, min_generation: Generation) -> Result<Snapshot, ControllerError> {
        self.check_open()?;
        let state = self.state.read();
        let mut parts = Vec::with_capacity(state.readers.len() + 1);
        for reader in state.readers.iter().filter(|r| r.generation() >= min_generation) {
            parts.push((reader.total_operations(), reader.new_snapshot()?));
        }
        let (tail_count, tail_iter) = state.writer.new_snapshot_of_tail()?;
        parts.push((tail_count, tail_iter));
        Ok(Snapshot::from_parts(parts))
    }

    pub(crate) fn register_view(&self, min_generation: Generation) -> u64 {
        let id = self.next_view_id.fetch_add(1, Ordering::Relaxed);
        self.views.lock().insert(id, min_generation);
        id
    }

    pub(crate) fn unregister_view(&self, id: u64) {
        self.views.lock().remove(&id);
    }

    fn min_view_generation(&self) -> Option<Generation> {
        self.views.lock().values().copied().min()
    }

    pub(crate) fn current_file_generation(&self) -> Generation {
        self.state.read().writer.generation()
    }

    pub(crate) fn uuid(&self) -> TlogUuid {
        self.uuid
    }

    pub(crate) fn total_operations(&self) -> u64 {
        let state = self.state.read();
        state.writer.num_ops_written() + state.readers.iter().map(Reader::total_operations).sum::<u64>()
    }

    pub(crate) fn size_in_bytes(&self) -> u64 {
        let state = self.state.read();
        state.writer.write_offset() + state.readers.iter().map(Reader::size_in_bytes).sum::<u64>()
    }

    pub(crate) fn stats(&self) -> Result<TranslogStats, ControllerError> {
        self.check_open()?;
        let state = self.state.read();
        let last_committed = state.last_committed_generation.unwrap_or(0);

        let num_operations =
            state.writer.num_ops_written() + state.readers.iter().map(Reader::total_operations).sum::<u64>();

        let uncommitted_operations = state.writer.num_ops_written()
            + state
                .readers
                .iter()
                .filter(|r| r.generation() > last_committed)
                .map(Reader::total_operations)
                .sum::<u64>();
        let uncommitted_size_in_bytes = state.writer.write_offset()
            + state
                .readers
                .iter()
                .filter(|r| r.generation() > last_committed)
                .map(Reader::size_in_bytes)
                .sum::<u64>();

        let earliest_generation = state
            .readers
            .first()
            .map(Reader::generation)
            .unwrap_or_else(|| state.writer.generation());
        let earliest_last_modified_age_secs = fs::metadata(tlog_path(&self.dir, earliest_generation))
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map_or(0, |d| d.as_secs());

        Ok(TranslogStats {
            current_generation: state.writer.generation(),
            num_operations,
            uncommitted_operations,
            uncommitted_size_in_bytes,
            earliest_last_modified_age_secs,
        })
    }

    #[instrument(skip(self), level = "debug")]
    pub(crate) fn prepare_commit(&self) -> Result<Generation, ControllerError> {
        self.check_open()?;
        let mut state = self.state.write();
        self.prepare_commit_locked(&mut state)
    }

    /// The body of `prepare_commit`, assuming the caller already holds
    /// `self.state`'s write lock. Exists so `commit` can run
    /// prepare-then-finalize as a single writer-lock-held critical section
    /// instead of releasing and re-acquiring the lock between the two,
    /// matching the locking discipline's contract that `commit` holds the
    /// write lock for its entire duration.
    fn prepare_commit_locked(&self, state: &mut State) -> Result<Generation, ControllerError> {
        if state.current_committing_generation.is_some() {
            return Err(ControllerError::IllegalState {
                reason: "prepare_commit called while a commit is already in flight".to_string(),
            });
        }

        let sealing_generation = state.writer.generation();
        state.current_committing_generation = Some(sealing_generation);

        state.writer.sync()?;
        let sealed_reader = state.writer.close_into_reader()?;

        let live = checkpoint::read(&live_checkpoint_path(&self.dir))?;
        if live.generation != sealing_generation {
            return Err(ControllerError::IllegalState {
                reason: format!(
                    "live checkpoint names generation {}, expected the sealing generation {sealing_generation}",
                    live.generation
                ),
            });
        }

        let sidecar_path = sealed_checkpoint_path(&self.dir, sealing_generation);
        checkpoint::write(&sidecar_path, live, CreateMode::CreateNew)?;

        state.readers.push(sealed_reader);

        let next_generation = sealing_generation + 1;
        let new_writer = Writer::create_new(
            self.dir.clone(),
            self.uuid,
            next_generation,
            self.config.write_buffer_size,
            self.config.fsync_on_every_append,
            Arc::clone(&self.gcp_supplier),
        )?;
        new_writer.sync()?;
        state.writer = new_writer;

        debug!(sealing_generation, next_generation, "prepared commit");
        Ok(sealing_generation)
    }

    #[instrument(skip(self), level = "debug")]
    pub(crate) fn commit(&self) -> Result<Generation, ControllerError> {
        self.check_open()?;
        let mut state = self.state.write();

        if state.current_committing_generation.is_none() {
            self.prepare_commit_locked(&mut state)?;
        }

        let committing = state.current_committing_generation.ok_or_else(|| ControllerError::IllegalState {
            reason: "commit called with no generation pending from prepare_commit".to_string(),
        })?;
        if !state.readers.iter().any(|r| r.generation() == committing) {
            return Err(ControllerError::IllegalState {
                reason: format!("reader list does not contain the committing generation {committing}"),
            });
        }

        let new_live_generation = state.writer.generation();
        state.last_committed_generation = Some(new_live_generation);
        state.current_committing_generation = None;
        drop(state);

        self.trim_unreferenced_readers();
        debug!(new_live_generation, "committed");
        Ok(new_live_generation)
    }

    /// Discards everything written since the last commit: closes the
    /// current writer without sealing it into the reader list, removes its
    /// data file and any sidecar it may have produced via a partial
    /// `prepare_commit`, and reopens a writer at the same generation the
    /// last commit left live.
    #[instrument(skip(self), level = "debug")]
    pub(crate) fn rollback(&self) -> Result<Generation, ControllerError> {
        self.check_open()?;
        let mut state = self.state.write();

        let discarded_generation = state.writer.generation();
        state.writer.close_into_reader().ok();

        // Reuse the discarded generation's own number: the file and sidecar
        // are removed below, so re-creating the writer at the same number
        // leaves the directory exactly as if this generation's prepare_commit
        // had never run, rather than burning a generation number on an abort.
        let resume_generation = discarded_generation;

        fs::remove_file(tlog_path(&self.dir, discarded_generation)).ok();
        fs::remove_file(sealed_checkpoint_path(&self.dir, discarded_generation)).ok();
        fsync_directory(&self.dir)?;

        let resume_checkpoint = if resume_generation == 1 {
            Checkpoint::initial((self.gcp_supplier)())
        } else {
            let previous = resume_generation - 1;
            checkpoint::read(&sealed_checkpoint_path(&self.dir, previous)).unwrap_or_else(|_| Checkpoint {
                ops_count: 0,
                offset: 0,
                generation: previous,
                global_checkpoint: (self.gcp_supplier)(),
            })
        };
        checkpoint::write(&live_checkpoint_path(&self.dir), resume_checkpoint, CreateMode::Overwrite)?;

        let resumed_writer = Writer::create_new(
            self.dir.clone(),
            self.uuid,
            resume_generation,
            self.config.write_buffer_size,
            self.config.fsync_on_every_append,
            Arc::clone(&self.gcp_supplier),
        )?;
        resumed_writer.sync()?;
        state.writer = resumed_writer;
        state.current_committing_generation = None;

        warn!(discarded_generation, resume_generation, "rolled back uncommitted generation");
        Ok(resume_generation)
    }

    #[instrument(skip(self), level = "debug")]
    pub(crate) fn trim_unreferenced_readers(&self) {
        let mut state = self.state.write();
        let min_retained = match (state.last_committed_generation, self.min_view_generation()) {
            (Some(committed), Some(view_min)) => committed.min(view_min),
            (Some(committed), None) => committed,
            (None, Some(view_min)) => view_min,
            (None, None) => return,
        };

        let (keep, drop_readers): (Vec<_>, Vec<_>) =
            state.readers.drain(..).partition(|r| r.generation() >= min_retained);
        state.readers = keep;
        drop(state);

        for reader in drop_readers {
            let generation = reader.generation();
            drop(reader);
            if let Err(err) = fs::remove_file(tlog_path(&self.dir, generation)) {
                warn!(generation, %err, "failed to unlink trimmed generation data file");
            }
            if let Err(err) = fs::remove_file(sealed_checkpoint_path(&self.dir, generation)) {
                warn!(generation, %err, "failed to unlink trimmed generation checkpoint sidecar");
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = self.state.read();
        if let Err(err) = state.writer.sync() {
            warn!(%err, "final sync on close failed");
        }
        debug!("controller closed");
    }
}

/// Orchestrates the whole log: append, sync, rotate, retain, and recover.
///
/// Cloning a `Tlog` is cheap and shares the same underlying state (the
/// clone and the original observe each other's writes); this mirrors how
/// [`View`] holds its own reference to the same shared state.
pub struct Tlog(Arc<Inner>);

impl Clone for Tlog {
    fn clone(&self) -> Self {
        Tlog(Arc::clone(&self.0))
    }
}

impl Tlog {
    /// Opens a tlog directory.
    ///
    /// `recover_from`, when `Some((uuid, expected_generation))`, runs
    /// recovery (§4.8) against an existing directory. When `None`, the
    /// directory is wiped and reinitialized fresh at generation 1 with a
    /// newly generated [`TlogUuid`].
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if the directory cannot be prepared, or
    /// (in the recovering case) if recovery fails.
    #[instrument(skip(config, gcp_supplier), level = "debug")]
    pub fn open(
        config: TlogConfig,
        recover_from: Option<(TlogUuid, Generation)>,
        gcp_supplier: GlobalCheckpointSupplier,
    ) -> Result<Self, ControllerError> {
        let dir = config.data_dir().to_path_buf();

        let (uuid, writer, readers, last_committed_generation) = match recover_from {
            None => {
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
                fs::create_dir_all(&dir)?;

                let uuid = TlogUuid::new_random();
                let initial = Checkpoint::initial(-2);
                checkpoint::write(&live_checkpoint_path(&dir), initial, CreateMode::CreateNew)?;
                fsync_directory(&dir)?;

                let writer = Writer::create_new(
                    dir.clone(),
                    uuid,
                    1,
                    config.write_buffer_size,
                    config.fsync_on_every_append,
                    Arc::clone(&gcp_supplier),
                )?;
                info!(dir = %dir.display(), %uuid, "initialized fresh tlog directory");
                (uuid, writer, Vec::new(), None)
            }
            Some((uuid, expected_generation)) => {
                let recovered = recovery::recover(&dir, uuid, expected_generation, &config, Arc::clone(&gcp_supplier))?;
                info!(
                    dir = %dir.display(),
                    %uuid,
                    generation = recovered.writer.generation(),
                    "recovered tlog directory"
                );
                (uuid, recovered.writer, recovered.readers, Some(recovered.last_committed_generation))
            }
        };

        Ok(Tlog(Arc::new(Inner {
            dir,
            uuid,
            config,
            gcp_supplier,
            state: RwLock::new(State {
                writer,
                readers,
                last_committed_generation,
                current_committing_generation: None,
            }),
            views: Mutex::new(std::collections::HashMap::new()),
            next_view_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })))
    }

    /// Encodes and appends `op` to the current generation.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::AlreadyClosed`] if the controller has been
    /// closed. Any fatal I/O error surfaced by the writer also closes the
    /// controller before this call returns.
    pub fn append(&self, op: &Operation) -> Result<Location, ControllerError> {
        self.0.append(op)
    }

    /// Ensures at least `write_offset()` bytes of the current generation are
    /// durable.
    ///
    /// # Errors
    ///
    /// See [`Tlog::append`].
    pub fn sync(&self) -> Result<bool, ControllerError> {
        self.0.sync()
    }

    /// Ensures `location` is durable. A no-op returning `false` if
    /// `location`'s generation has already been sealed.
    ///
    /// # Errors
    ///
    /// See [`Tlog::append`].
    pub fn ensure_synced(&self, location: Location) -> Result<bool, ControllerError> {
        self.0.ensure_synced(location)
    }

    /// Equivalent to `ensure_synced(locations.max())`.
    ///
    /// # Errors
    ///
    /// See [`Tlog::append`].
    pub fn ensure_synced_all<I>(&self, locations: I) -> Result<bool, ControllerError>
    where
        I: IntoIterator<Item = Location>,
    {
        self.0.ensure_synced_all(locations)
    }

    /// The `global_checkpoint` last written to the live checkpoint file.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if the live checkpoint cannot be read.
    pub fn last_synced_global_checkpoint(&self) -> Result<i64, ControllerError> {
        self.0.last_synced_global_checkpoint()
    }

    /// A snapshot over every retained generation plus the writer's tail.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if a retained reader or the writer's tail
    /// cannot be opened for iteration.
    pub fn new_snapshot(&self) -> Result<Snapshot, ControllerError> {
        self.0.new_snapshot()
    }

    /// Opens a new [`View`] pinning retention at the current
    /// `last_committed_generation`.
    #[must_use]
    pub fn new_view(&self) -> View {
        let min_generation = self.0.state.read().last_committed_generation.unwrap_or(0);
        let id = self.0.register_view(min_generation);
        View::new(id, min_generation, Arc::clone(&self.0))
    }

    /// Seals the current writer into a reader and opens a new writer,
    /// without yet marking the sealed generation's data trimmable.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::IllegalState`] if a commit is already in
    /// flight.
    pub fn prepare_commit(&self) -> Result<Generation, ControllerError> {
        self.0.prepare_commit()
    }

    /// Finalizes the in-flight commit (calling `prepare_commit` first if
    /// one was not already started) and runs a retention trim.
    ///
    /// # Errors
    ///
    /// See [`Tlog::prepare_commit`].
    pub fn commit(&self) -> Result<Generation, ControllerError> {
        self.0.commit()
    }

    /// Discards uncommitted state, reopening a writer at the generation the
    /// last successful commit left live.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError`] if the resume checkpoint cannot be
    /// written or the new writer cannot be created.
    pub fn rollback(&self) -> Result<Generation, ControllerError> {
        self.0.rollback()
    }

    #[must_use]
    pub fn current_file_generation(&self) -> Generation {
        self.0.current_file_generation()
    }

    #[must_use]
    pub fn generation(&self) -> (TlogUuid, Generation) {
        (self.0.uuid(), self.0.current_file_generation())
    }

    #[must_use]
    pub fn total_operations(&self) -> u64 {
        self.0.total_operations()
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        self.0.size_in_bytes()
    }

    /// A point-in-time introspection snapshot; see [`TranslogStats`].
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::AlreadyClosed`] if the controller is
    /// closed.
    pub fn stats(&self) -> Result<TranslogStats, ControllerError> {
        self.0.stats()
    }

    /// Idempotently closes the controller: fsyncs the current writer and
    /// marks the controller closed. Readers/writer file handles are
    /// released as the last [`Tlog`]/[`View`] clone holding them is
    /// dropped.
    pub fn close(&self) {
        self.0.close();
    }
}
