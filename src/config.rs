//! Caller-facing configuration: durability strictness and sizing knobs.
//!
//! Mirrors the builder shape used throughout this codebase's disk-facing
//! configuration: a `from_path` constructor, fluent setters, and a fallible
//! `build()` that validates parameters up front rather than deep inside the
//! hot path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Default size, in bytes, of the writer's in-memory append buffer before it
/// is flushed to the OS.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// How aggressively the tlog should force data to stable storage.
///
/// This only governs *when* a sync happens relative to a caller's write
/// acknowledgement; it has no bearing on the on-disk format or on recovery,
/// both of which are always fully durable once a sync has actually run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Every user-facing write triggers a `sync` before acknowledgement.
    Request,
    /// Syncs happen on an interval owned by an external scheduler; appends
    /// return as soon as they're buffered in memory.
    Async,
}

impl Default for Durability {
    fn default() -> Self {
        Durability::Request
    }
}

/// Error building a [`TlogConfig`].
#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{param_name}' was invalid: {reason}"))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Fully validated configuration for opening a [`Tlog`](crate::controller::Tlog).
#[derive(Debug, Clone)]
pub struct TlogConfig {
    pub(crate) data_dir: PathBuf,
    pub(crate) durability: Durability,
    pub(crate) write_buffer_size: usize,
    pub(crate) fsync_on_every_append: bool,
}

impl TlogConfig {
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn durability(&self) -> Durability {
        self.durability
    }

    #[must_use]
    pub fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    #[must_use]
    pub fn fsync_on_every_append(&self) -> bool {
        self.fsync_on_every_append
    }
}

/// Builder for [`TlogConfig`].
#[derive(Debug, Clone)]
pub struct TlogConfigBuilder {
    data_dir: PathBuf,
    durability: Durability,
    write_buffer_size: Option<usize>,
    fsync_on_every_append: bool,
}

impl TlogConfigBuilder {
    /// Starts a builder rooted at `data_dir`.
    pub fn from_path(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            durability: Durability::default(),
            write_buffer_size: None,
            fsync_on_every_append: false,
        }
    }

    /// Sets the durability strictness. Defaults to [`Durability::Request`].
    #[must_use]
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the size, in bytes, of the writer's internal append buffer.
    /// Defaults to [`DEFAULT_WRITE_BUFFER_SIZE`].
    #[must_use]
    pub fn write_buffer_size(mut self, amount: usize) -> Self {
        self.write_buffer_size = Some(amount);
        self
    }

    /// Forces an fsync after every single append, bypassing buffering
    /// entirely. Meant for tests and for extremely low-throughput,
    /// extremely strict deployments; defaults to `false`.
    #[must_use]
    pub fn fsync_on_every_append(mut self, enabled: bool) -> Self {
        self.fsync_on_every_append = enabled;
        self
    }

    /// Validates the builder and produces a [`TlogConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidParameter`] if `write_buffer_size` is
    /// zero.
    pub fn build(self) -> Result<TlogConfig, BuildError> {
        let write_buffer_size = self.write_buffer_size.unwrap_or(DEFAULT_WRITE_BUFFER_SIZE);
        if write_buffer_size == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "write_buffer_size",
                reason: "cannot be zero".to_string(),
            });
        }

        Ok(TlogConfig {
            data_dir: self.data_dir,
            durability: self.durability,
            write_buffer_size,
            fsync_on_every_append: self.fsync_on_every_append,
        })
    }
}

/// The minimum window of time an async-durability scheduler should wait
/// between syncs; a convenience constant, not an enforced limit.
pub const MIN_ASYNC_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
