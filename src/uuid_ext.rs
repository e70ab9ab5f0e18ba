//! The identifier that binds a tlog directory to a specific engine commit.

use uuid::Uuid;

/// A random identifier assigned the first time a tlog directory is created,
/// and embedded in the header of every `.tlog` file written under it.
///
/// Opening a directory whose files carry a different [`TlogUuid`] than the
/// caller expects is a fatal `HeaderError::Corruption` error: the directory
/// belongs to a different engine commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlogUuid(Uuid);

impl TlogUuid {
    /// Generates a new random [`TlogUuid`].
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing [`Uuid`], e.g. one read back from a file header.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the 16-byte little/big-endian-agnostic representation used on
    /// disk.
    #[must_use]
    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Reconstructs a [`TlogUuid`] from its 16-byte on-disk representation.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl std::fmt::Display for TlogUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
