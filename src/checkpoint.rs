//! The checkpoint codec (component C1).
//!
//! A [`Checkpoint`] is a small, fixed-size record describing how far a
//! generation has been durably synced. It is written as a single `write(2)`
//! call so that, on any filesystem the engine cares about, the write is
//! atomic from the point of view of a concurrent reader: readers either see
//! the old bytes in full or the new bytes in full, never a mix. Partial
//! ("torn") writes caused by a mid-write crash are not repaired; they are
//! caught by the trailing CRC32 at read time and reported as corruption.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use snafu::{ResultExt, Snafu};

use crate::generation::fsync_directory;
use crate::Generation;

/// On-disk size of a [`Checkpoint`] record: four fixed-width fields plus a
/// trailing CRC32, little-endian, no padding.
pub const CHECKPOINT_SIZE: usize = 4 + 8 + 8 + 8 + 4;

/// How [`write`] should open the destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// The file must not already exist; used the first time a directory is
    /// initialized.
    CreateNew,
    /// Overwrite whatever is there, used for every subsequent live
    /// checkpoint update.
    Overwrite,
}

/// A single checkpoint record, as defined in spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Number of operations in the referenced generation, up to `offset`.
    pub ops_count: u32,
    /// Bytes synced in the referenced generation.
    pub offset: u64,
    /// The generation this checkpoint describes.
    pub generation: Generation,
    /// Externally supplied sequence-number watermark; advisory at this
    /// layer (see spec §9's open question).
    pub global_checkpoint: i64,
}

impl Checkpoint {
    /// Builds the checkpoint written when a brand-new tlog directory is
    /// created: nothing has been written yet, generation 1 is about to be
    /// opened.
    #[must_use]
    pub fn initial(global_checkpoint: i64) -> Self {
        Self {
            ops_count: 0,
            offset: 0,
            generation: 1,
            global_checkpoint,
        }
    }

    fn to_bytes(self) -> [u8; CHECKPOINT_SIZE] {
        let mut buf = [0u8; CHECKPOINT_SIZE];
        buf[0..4].copy_from_slice(&self.ops_count.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..20].copy_from_slice(&self.generation.to_le_bytes());
        buf[20..28].copy_from_slice(&self.global_checkpoint.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..28]);
        buf[28..32].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; CHECKPOINT_SIZE]) -> Result<Self, CheckpointError> {
        let calculated = crc32fast::hash(&buf[0..28]);
        let stored = u32::from_le_bytes(buf[28..32].try_into().expect("4 bytes"));
        if calculated != stored {
            return Err(CheckpointError::Corruption {
                reason: format!(
                    "checksum mismatch: calculated {calculated:#x}, stored {stored:#x}"
                ),
            });
        }
        Ok(Self {
            ops_count: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            offset: u64::from_le_bytes(buf[4..12].try_into().expect("8 bytes")),
            generation: u64::from_le_bytes(buf[12..20].try_into().expect("8 bytes")),
            global_checkpoint: i64::from_le_bytes(buf[20..28].try_into().expect("8 bytes")),
        })
    }
}

/// Error that occurred while reading or writing a [`Checkpoint`].
#[derive(Debug, Snafu)]
pub enum CheckpointError {
    /// A general I/O error occurred opening, reading, writing, or syncing
    /// the checkpoint file or its containing directory.
    #[snafu(display("checkpoint I/O error: {source}"))]
    Io { source: io::Error },

    /// The checkpoint file was short, or its trailing CRC32 did not match
    /// its contents. Either way the record cannot be trusted.
    #[snafu(display("checkpoint corruption: {reason}"))]
    Corruption { reason: String },
}

impl From<io::Error> for CheckpointError {
    fn from(source: io::Error) -> Self {
        CheckpointError::Io { source }
    }
}

/// Writes `record` to `path`, per `create_mode`, then fsyncs the file and
/// its containing directory.
///
/// This does *not* fsync the tlog data file the checkpoint refers to; the
/// caller (the [`Writer`](crate::writer::Writer)) is responsible for doing
/// that first, so that the `offset` this checkpoint names is always backed
/// by durable data by the time the checkpoint itself becomes visible.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] if the file cannot be opened, written,
/// or synced.
#[instrument(skip(record), level = "trace")]
pub fn write(path: &Path, record: Checkpoint, create_mode: CreateMode) -> Result<(), CheckpointError> {
    let mut options = OpenOptions::new();
    options.write(true);
    match create_mode {
        CreateMode::CreateNew => {
            options.create_new(true);
        }
        CreateMode::Overwrite => {
            options.create(true).truncate(true);
        }
    }
    let mut file = options.open(path).context(IoSnafu)?;
    file.write_all(&record.to_bytes()).context(IoSnafu)?;
    file.sync_all().context(IoSnafu)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fsync_directory(parent).context(IoSnafu)?;

    trace!(path = %path.display(), ?record, "wrote checkpoint");
    Ok(())
}

/// Reads and verifies the checkpoint record at `path`.
///
/// # Errors
///
/// Returns [`CheckpointError::Corruption`] if the file is short or its CRC32
/// does not match, and [`CheckpointError::Io`] for any other I/O failure.
pub fn read(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let mut file = File::open(path).context(IoSnafu)?;
    let mut buf = Vec::with_capacity(CHECKPOINT_SIZE);
    file.read_to_end(&mut buf).context(IoSnafu)?;
    if buf.len() != CHECKPOINT_SIZE {
        return Err(CheckpointError::Corruption {
            reason: format!(
                "expected a {CHECKPOINT_SIZE}-byte checkpoint, found {} bytes",
                buf.len()
            ),
        });
    }
    let fixed: [u8; CHECKPOINT_SIZE] = buf.try_into().expect("length checked above");
    Checkpoint::from_bytes(&fixed)
}

/// Byte-for-byte equality of two checkpoints, used by recovery step R4 to
/// reconcile a sealed sidecar against the live checkpoint.
#[must_use]
pub fn equal(a: &Checkpoint, b: &Checkpoint) -> bool {
    a.to_bytes() == b.to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            ops_count: 3,
            offset: 128,
            generation: 2,
            global_checkpoint: 41,
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let ckp = sample();
        let decoded = Checkpoint::from_bytes(&ckp.to_bytes()).unwrap();
        assert_eq!(ckp, decoded);
    }

    #[test]
    fn write_then_read_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translog.ckp");
        write(&path, sample(), CreateMode::CreateNew).unwrap();
        let decoded = read(&path).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn create_new_fails_if_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translog.ckp");
        write(&path, sample(), CreateMode::CreateNew).unwrap();
        let err = write(&path, sample(), CreateMode::CreateNew).unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
    }

    #[test]
    fn overwrite_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translog.ckp");
        write(&path, sample(), CreateMode::CreateNew).unwrap();
        let mut updated = sample();
        updated.offset = 256;
        write(&path, updated, CreateMode::Overwrite).unwrap();
        assert_eq!(read(&path).unwrap(), updated);
    }

    #[test]
    fn single_byte_mutation_is_detected_as_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translog.ckp");
        write(&path, sample(), CreateMode::CreateNew).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[5] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = read(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::Corruption { .. }));
    }

    #[test]
    fn short_file_is_corruption_not_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translog.ckp");
        std::fs::write(&path, [0u8; 10]).unwrap();
        let err = read(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::Corruption { .. }));
    }

    #[test]
    fn equal_detects_divergence() {
        let a = sample();
        let mut b = sample();
        assert!(equal(&a, &b));
        b.offset += 1;
        assert!(!equal(&a, &b));
    }
}
