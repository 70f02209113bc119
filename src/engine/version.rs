//! # Change Version Tracker
//!
//! A monotonic clock owned by each world. Every committed structural change, direct
//! mutable access, and write-intent job grant ticks the clock and stamps the
//! affected `(chunk, component)` columns with the new value.
//!
//! Per-column stamps live next to the column in [`Chunk`](crate::engine::chunk::Chunk);
//! this module only owns the clock. Versions are a filter: nothing blocks or
//! orders on them.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::types::Version;

/// Monotonic change clock. Starts at `1`; `0` means "never changed".
#[derive(Debug)]
pub struct VersionClock {
    current: AtomicU64,
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionClock {
    /// Creates a clock at version `1`.
    pub const fn new() -> Self {
        Self { current: AtomicU64::new(1) }
    }

    /// Latest issued version.
    #[inline]
    pub fn current(&self) -> Version {
        self.current.load(Ordering::Acquire)
    }

    /// Advances the clock and returns the new version.
    #[inline]
    pub fn advance(&self) -> Version {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Returns `true` if a column stamped `last_changed` changed after `since`.
#[inline]
pub fn changed_since(last_changed: Version, since: Version) -> bool {
    last_changed > since
}
