//! A per-shard durable transaction log.
//!
//! This crate implements an append-only record of index-modifying operations
//! (index, delete, no-op) that have been acknowledged by a search shard but
//! may not yet be reflected in its immutable segments. It provides durability
//! of acknowledged writes across process crashes (at a caller-chosen
//! [`Durability`](config::Durability)), a replayable stream of operations for
//! engine recovery, and retention of recent generations across outstanding
//! [`View`](view::View)s.
//!
//! The moving parts, leaves first:
//!
//! - [`checkpoint`] — the fixed-size, atomically-written record describing
//!   how much of a generation is durable.
//! - [`operation`] — the per-operation wire format: length-prefixed,
//!   checksummed, with an [`Operation`](operation::Operation) sum type.
//! - [`writer`] — owns the currently-active log file.
//! - [`reader`] — random access over a sealed generation.
//! - [`snapshot`] — a point-in-time iterator over the log's contents.
//! - [`view`] — a named handle pinning retention of older generations.
//! - [`controller`] — orchestrates all of the above: open/recover, append,
//!   sync, rotate, retain, close.
//!
//! Out of scope: deciding *when* to commit, replication transport, field
//! mapping/analysis, and everything else that merely calls into this crate.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

#[macro_use]
extern crate tracing;

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod generation;
mod header;
pub mod location;
pub mod operation;
mod recovery;
pub mod reader;
pub mod snapshot;
mod uuid_ext;
pub mod view;
pub mod writer;

pub use checkpoint::Checkpoint;
pub use config::{Durability, TlogConfig, TlogConfigBuilder};
pub use controller::{ControllerError, Tlog};
pub use location::Location;
pub use operation::Operation;
pub use reader::Reader;
pub use snapshot::Snapshot;
pub use uuid_ext::TlogUuid;
pub use view::View;

/// A monotonically increasing generation identifier.
///
/// Generation `0` never names a real file; the first writer is always opened
/// at generation `1`.
pub type Generation = u64;

/// Sentinel used by [`read_global_checkpoint`] and [`Checkpoint`] for an
/// unassigned global checkpoint watermark.
pub const UNASSIGNED_GLOBAL_CHECKPOINT: i64 = -2;

/// Reads the `global_checkpoint` field out of a directory's live checkpoint
/// file without opening a full [`Tlog`].
///
/// This does not mutate the directory in any way; it is safe to call
/// concurrently with an open controller.
///
/// # Errors
///
/// Returns an error if the live checkpoint file is missing, truncated, or
/// fails its checksum.
pub fn read_global_checkpoint(dir: impl AsRef<std::path::Path>) -> Result<i64, checkpoint::CheckpointError> {
    let path = generation::live_checkpoint_path(dir.as_ref());
    checkpoint::read(&path).map(|ckp| ckp.global_checkpoint)
}
