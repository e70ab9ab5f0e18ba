//! The coordinate of one appended operation.

use std::cmp::Ordering;
use std::fmt;

use crate::Generation;

/// Identifies one appended record: which generation it lives in, the byte
/// offset (within that generation's data, after the header) at which it
/// starts, and its encoded size.
///
/// Returned by every successful [`Tlog::append`](crate::controller::Tlog::append)
/// so that callers can later request "sync up to at least this location".
///
/// Ordered lexicographically by `(generation, offset)`; `size` participates
/// in equality but not in ordering, matching the invariant in the spec that
/// two locations with the same `(generation, offset)` always describe the
/// same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub generation: Generation,
    pub offset: u64,
    pub size: u64,
}

impl Location {
    #[must_use]
    pub fn new(generation: Generation, offset: u64, size: u64) -> Self {
        Self {
            generation,
            offset,
            size,
        }
    }
}

impl PartialOrd for Location {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Location {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.generation, self.offset).cmp(&(other.generation, other.offset))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Location(gen={}, offset={}, size={})",
            self.generation, self.offset, self.size
        )
    }
}

/// Collapses a stream of locations to the single greatest one, per the
/// `ensure_synced(stream_of_locations)` contract in the spec.
#[must_use]
pub fn max_location<I>(locations: I) -> Option<Location>
where
    I: IntoIterator<Item = Location>,
{
    locations.into_iter().max()
}
