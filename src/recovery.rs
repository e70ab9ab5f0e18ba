//! Recovery (component C8): reconstructs controller state from the on-disk
//! files alone, given the UUID and generation the caller last observed.

use std::fs;
use std::io;
use std::path::Path;

use snafu::Snafu;

use crate::checkpoint::{self, Checkpoint, CheckpointError, CreateMode};
use crate::generation::{fsync_directory, sealed_checkpoint_path, tlog_path, FILE_PREFIX};
use crate::header::HEADER_LEN;
use crate::reader::{Reader, ReaderError};
use crate::writer::{GlobalCheckpointSupplier, Writer, WriterError};
use crate::{Generation, TlogConfig, TlogUuid};

/// Error encountered while recovering a tlog directory.
#[derive(Debug, Snafu)]
pub enum RecoveryError {
    #[snafu(display("recovery I/O error: {source}"))]
    Io { source: io::Error },

    #[snafu(display("failed to load a checkpoint during recovery: {source}"))]
    Checkpoint { source: CheckpointError },

    #[snafu(display("failed to open a generation during recovery: {source}"))]
    Reader { source: ReaderError },

    #[snafu(display("failed to open the post-recovery writer: {source}"))]
    Writer { source: WriterError },

    #[snafu(display("recovery corruption: {reason}"))]
    Corruption { reason: String },

    #[snafu(display("recovery protocol violation: {reason}"))]
    IllegalState { reason: String },
}

impl From<io::Error> for RecoveryError {
    fn from(source: io::Error) -> Self {
        RecoveryError::Io { source }
    }
}

impl From<CheckpointError> for RecoveryError {
    fn from(source: CheckpointError) -> Self {
        RecoveryError::Checkpoint { source }
    }
}

impl From<ReaderError> for RecoveryError {
    fn from(source: ReaderError) -> Self {
        RecoveryError::Reader { source }
    }
}

impl From<WriterError> for RecoveryError {
    fn from(source: WriterError) -> Self {
        RecoveryError::Writer { source }
    }
}

/// The reconstructed controller state, ready to be handed to [`Tlog`](crate::controller::Tlog).
pub(crate) struct Recovered {
    pub readers: Vec<Reader>,
    pub writer: Writer,
    pub last_committed_generation: Generation,
}

/// Runs recovery steps R1 through R5 against `dir`.
///
/// # Errors
///
/// Returns [`RecoveryError`] if any step fails; every reader and writer
/// opened before the failing step is dropped (and thus closed) on the way
/// out, since ownership of them never escapes this function on an error
/// path.
#[instrument(skip(config, gcp_supplier), level = "debug")]
pub(crate) fn recover(
    dir: &Path,
    uuid: TlogUuid,
    expected_file_generation: Generation,
    config: &TlogConfig,
    gcp_supplier: GlobalCheckpointSupplier,
) -> Result<Recovered, RecoveryError> {
    let checkpoint = checkpoint::read(&crate::generation::live_checkpoint_path(dir))?;
    let cp_gen = checkpoint.generation;

    step_r1_mid_rotation_cleanup(dir, cp_gen)?;
    let mut readers = step_r2_reader_reconstruction(dir, uuid, expected_file_generation, cp_gen)?;
    step_r3_tail_reader(dir, uuid, cp_gen, checkpoint, &mut readers)?;
    step_r4_sidecar_reconciliation(dir, cp_gen, checkpoint)?;
    let writer = step_r5_new_writer(dir, uuid, cp_gen, config, gcp_supplier)?;

    debug!(cp_gen, expected_file_generation, readers = readers.len(), "recovery complete");

    Ok(Recovered {
        readers,
        writer,
        last_committed_generation: expected_file_generation,
    })
}

/// R1: the prior instance may have crashed between "create next-gen file"
/// and "write new live checkpoint pointing to it". An orphaned,
/// header-only `<prefix>-(cp_gen+1).tlog` is harmless and is unlinked
/// unconditionally here: whether or not the sidecar for `cp_gen` had
/// already been written, the orphan carries no operation data, so deleting
/// it now and letting step R5 create a fresh file at the same path is
/// indistinguishable on disk from "leaving it to be overwritten".
fn step_r1_mid_rotation_cleanup(dir: &Path, cp_gen: Generation) -> Result<(), RecoveryError> {
    let orphan_path = tlog_path(dir, cp_gen + 1);
    if !orphan_path.exists() {
        return Ok(());
    }

    let orphan_len = fs::metadata(&orphan_path)?.len();
    if orphan_len > HEADER_LEN {
        return Err(RecoveryError::Corruption {
            reason: format!(
                "orphaned generation {} is {orphan_len} bytes, expected at most a bare header",
                cp_gen + 1
            ),
        });
    }

    fs::remove_file(&orphan_path)?;
    fsync_directory(dir)?;
    debug!(generation = cp_gen + 1, "removed orphaned mid-rotation file");
    Ok(())
}

/// R2: every generation strictly between `expected_file_generation` and
/// `cp_gen` must exist and is opened via its sealed sidecar.
fn step_r2_reader_reconstruction(
    dir: &Path,
    uuid: TlogUuid,
    expected_file_generation: Generation,
    cp_gen: Generation,
) -> Result<Vec<Reader>, RecoveryError> {
    let mut readers = Vec::new();
    for generation in expected_file_generation..cp_gen {
        if !tlog_path(dir, generation).exists() {
            return Err(RecoveryError::IllegalState {
                reason: format!("generations must be consecutive; missing generation {generation}"),
            });
        }
        readers.push(Reader::open_sealed(dir, generation, uuid)?);
    }
    Ok(readers)
}

/// R3: the generation the live checkpoint itself names is opened trusting
/// that checkpoint directly, since no sealed sidecar for it is guaranteed
/// to exist yet.
fn step_r3_tail_reader(
    dir: &Path,
    uuid: TlogUuid,
    cp_gen: Generation,
    checkpoint: Checkpoint,
    readers: &mut Vec<Reader>,
) -> Result<(), RecoveryError> {
    let tail = Reader::open_with_checkpoint(dir, cp_gen, uuid, checkpoint)?;
    readers.push(tail);
    Ok(())
}

/// R4: reconcile the sealed sidecar for `cp_gen` against the live
/// checkpoint, creating it via copy-then-atomic-rename if it is missing.
fn step_r4_sidecar_reconciliation(
    dir: &Path,
    cp_gen: Generation,
    checkpoint: Checkpoint,
) -> Result<(), RecoveryError> {
    let sidecar_path = sealed_checkpoint_path(dir, cp_gen);
    if sidecar_path.exists() {
        let existing = checkpoint::read(&sidecar_path)?;
        if !checkpoint::equal(&existing, &checkpoint) {
            return Err(RecoveryError::Corruption {
                reason: format!("sealed checkpoint for generation {cp_gen} diverges from the live checkpoint"),
            });
        }
        return Ok(());
    }

    let tmp_path = dir.join(format!("{FILE_PREFIX}-{cp_gen}.ckp.tmp"));
    if let Err(err) = checkpoint::write(&tmp_path, checkpoint, CreateMode::Overwrite) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    if let Err(err) = fs::rename(&tmp_path, &sidecar_path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    fsync_directory(dir)?;
    debug!(generation = cp_gen, "reconstructed sealed checkpoint sidecar");
    Ok(())
}

/// R5: a fresh writer at `cp_gen + 1` becomes the new live generation.
fn step_r5_new_writer(
    dir: &Path,
    uuid: TlogUuid,
    cp_gen: Generation,
    config: &TlogConfig,
    gcp_supplier: GlobalCheckpointSupplier,
) -> Result<Writer, RecoveryError> {
    Writer::create_new(
        dir.to_path_buf(),
        uuid,
        cp_gen + 1,
        config.write_buffer_size,
        config.fsync_on_every_append,
        gcp_supplier,
    )
    .map_err(RecoveryError::from)
}
