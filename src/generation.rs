//! Filename conventions and small directory-level helpers shared by every
//! component that touches the on-disk layout described in spec §6:
//!
//! ```text
//! <dir>/
//!   translog.ckp                 # live checkpoint (fixed size, atomic)
//!   translog-<gen>.tlog          # one per generation, append-only
//!   translog-<gen>.ckp           # sidecar sealed checkpoint for each committed gen
//! ```

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::Generation;

/// The fixed file-name prefix used by every tlog directory.
pub const FILE_PREFIX: &str = "translog";

/// Returns the path of generation `gen`'s data file.
#[must_use]
pub fn tlog_path(dir: &Path, generation: Generation) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}-{generation}.tlog"))
}

/// Returns the path of generation `gen`'s sealed checkpoint sidecar.
#[must_use]
pub fn sealed_checkpoint_path(dir: &Path, generation: Generation) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}-{generation}.ckp"))
}

/// Returns the path of the directory's live checkpoint file.
#[must_use]
pub fn live_checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(format!("{FILE_PREFIX}.ckp"))
}

/// Fsyncs a directory so that prior creates/renames/unlinks within it are
/// durable. On platforms where opening a directory for this purpose isn't
/// supported, this degrades to a no-op.
///
/// Every rotation and checkpoint write in this crate that creates, renames,
/// or removes a file calls this immediately afterwards, per spec §4.1/§4.7/§4.8.
pub fn fsync_directory(dir: &Path) -> io::Result<()> {
    match File::open(dir) {
        Ok(handle) => handle.sync_all(),
        Err(err) if cfg!(windows) && err.kind() == io::ErrorKind::PermissionDenied => Ok(()),
        Err(err) => Err(err),
    }
}
