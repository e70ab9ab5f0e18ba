//! The reader (component C4): random-access, read-only access to one sealed
//! generation.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Take};
use std::path::Path;

use snafu::{ResultExt, Snafu};

use crate::checkpoint::{self, Checkpoint, CheckpointError};
use crate::generation::{sealed_checkpoint_path, tlog_path};
use crate::header::{self, HeaderError, HEADER_LEN};
use crate::operation::{read_framed, Operation, OperationCodecError};
use crate::{Generation, TlogUuid};

/// Error opening a [`Reader`] or iterating its [`Operation`]s.
#[derive(Debug, Snafu)]
pub enum ReaderError {
    #[snafu(display("reader I/O error: {source}"))]
    Io { source: io::Error },

    #[snafu(display("failed to verify generation file header: {source}"))]
    Header { source: HeaderError },

    #[snafu(display("{source}"))]
    Codec { source: OperationCodecError },

    #[snafu(display("failed to load checkpoint for generation: {source}"))]
    Checkpoint { source: CheckpointError },
}

impl From<io::Error> for ReaderError {
    fn from(source: io::Error) -> Self {
        ReaderError::Io { source }
    }
}

impl From<OperationCodecError> for ReaderError {
    fn from(source: OperationCodecError) -> Self {
        ReaderError::Codec { source }
    }
}

/// Immutable, random-access view over one sealed generation's data file.
pub struct Reader {
    generation: Generation,
    file: File,
    uuid: TlogUuid,
    operations_count: u64,
    size_in_bytes: u64,
}

impl Reader {
    /// Wraps an already-open, already-verified file handle. Used when a
    /// [`Writer`](crate::writer::Writer) seals itself.
    pub(crate) fn from_parts(
        generation: Generation,
        file: File,
        uuid: TlogUuid,
        operations_count: u64,
        size_in_bytes: u64,
    ) -> Self {
        Self {
            generation,
            file,
            uuid,
            operations_count,
            size_in_bytes,
        }
    }

    /// Opens generation `generation`'s file fresh from disk, verifying its
    /// header against `uuid` and trusting `checkpoint` (which must already
    /// have been validated by the caller, e.g. via [`checkpoint::read`] or
    /// recovery's sidecar reconciliation) for the operation count and data
    /// extent.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Io`] if the file cannot be opened,
    /// [`ReaderError::Header`] if the header is corrupt or names a
    /// different UUID.
    pub fn open_with_checkpoint(
        dir: &Path,
        generation: Generation,
        uuid: TlogUuid,
        checkpoint: Checkpoint,
    ) -> Result<Self, ReaderError> {
        let path = tlog_path(dir, generation);
        let mut file = File::open(&path)?;
        header::read_and_verify(&mut file, uuid).context(HeaderSnafu)?;

        Ok(Self {
            generation,
            file,
            uuid,
            operations_count: u64::from(checkpoint.ops_count),
            size_in_bytes: checkpoint.offset,
        })
    }

    /// Opens generation `generation` using its sealed checkpoint sidecar
    /// (`<prefix>-<generation>.ckp`), as recovery step R2 does for every
    /// generation strictly before the checkpoint's own.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Checkpoint`] if the sidecar is missing or
    /// corrupt, or the same header errors as [`Reader::open_with_checkpoint`].
    pub fn open_sealed(dir: &Path, generation: Generation, uuid: TlogUuid) -> Result<Self, ReaderError> {
        let checkpoint = checkpoint::read(&sealed_checkpoint_path(dir, generation)).context(CheckpointSnafu)?;
        Self::open_with_checkpoint(dir, generation, uuid, checkpoint)
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub fn uuid(&self) -> TlogUuid {
        self.uuid
    }

    #[must_use]
    pub fn total_operations(&self) -> u64 {
        self.operations_count
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    /// Produces a lazy, finite, non-restartable sequence over this
    /// generation's operations, from the byte right after the header to
    /// `size_in_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Io`] if the underlying file handle cannot be
    /// duplicated or repositioned. Errors encountered *during* iteration
    /// (corruption, truncation) are yielded as `Some(Err(_))` items rather
    /// than returned here.
    pub fn new_snapshot(&self) -> Result<OperationIterator, ReaderError> {
        let mut clone = self.file.try_clone()?;
        clone.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(OperationIterator {
            reader: clone.take(self.size_in_bytes),
            done: false,
        })
    }
}

/// Iterator returned by [`Reader::new_snapshot`].
///
/// Once a [`ReaderError`] is yielded, the iterator is exhausted: subsequent
/// calls to `next()` return `None`, mirroring the spec's "stop here" framing
/// for a truncated or corrupt tail.
pub struct OperationIterator {
    reader: Take<File>,
    done: bool,
}

impl OperationIterator {
    /// Wraps an already-positioned, already-bounded file view. Used by the
    /// [`Writer`](crate::writer::Writer) to expose its unsealed tail to a
    /// [`Snapshot`](crate::snapshot::Snapshot) without sealing itself.
    pub(crate) fn new(reader: Take<File>) -> Self {
        Self { reader, done: false }
    }
}

impl Iterator for OperationIterator {
    type Item = Result<Operation, ReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_framed(&mut self.reader) {
            Ok(Some(op)) => Some(Ok(op)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err.into()))
            }
        }
    }
}
