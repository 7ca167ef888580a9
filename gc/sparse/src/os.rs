//! Platform commit/decommit interface.
//!
//! The façade owns a [`VirtualMemory`] capability instead of inheriting
//! from a general virtual-memory type: everything the sparse heap needs
//! from the platform is the ability to commit and decommit page ranges
//! inside the reservation that was handed to it at startup.
//!
//! Some platforms do not release pages on an ordinary decommit advisory;
//! there the implementation must re-map the range as a fresh anonymous
//! mapping over the same addresses, which requires the identifier
//! recorded when the range was committed. Such implementations report
//! [`requires_release_identifier`](VirtualMemory::requires_release_identifier)
//! and return a [`CommitIdentifier`] from [`commit`](VirtualMemory::commit).

use thiserror::Error;

use crate::extent::Extent;

bitflags::bitflags! {
    /// Access mode for committed pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryMode: u32 {
        /// Pages are readable.
        const READ = 1 << 0;
        /// Pages are writable.
        const WRITE = 1 << 1;
    }
}

/// Opaque accounting tag forwarded to the platform layer with every
/// commit, so the host can attribute the pages to a memory category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCategory(u32);

impl MemoryCategory {
    /// Wraps a raw category value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw category value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Record of a commit on platforms that release by identifier.
///
/// Carries the committed range plus an opaque platform token (mapping
/// handle, cookie, whatever the re-mapping release primitive needs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitIdentifier {
    extent: Extent,
    token: u64,
}

impl CommitIdentifier {
    /// Creates an identifier for `extent` with the platform's `token`.
    #[must_use]
    pub const fn new(extent: Extent, token: u64) -> Self {
        Self { extent, token }
    }

    /// The range this identifier was recorded for.
    #[must_use]
    pub const fn extent(self) -> Extent {
        self.extent
    }

    /// The opaque platform token.
    #[must_use]
    pub const fn token(self) -> u64 {
        self.token
    }
}

/// Error from the platform commit/decommit primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommitError {
    /// The platform could not back the range with pages.
    #[error("failed to commit {0:?}")]
    CommitFailed(Extent),
    /// The platform could not return the range's pages.
    #[error("failed to decommit {0:?}")]
    DecommitFailed(Extent),
}

/// Commit/decommit capability over the sparse reservation.
///
/// Implementations are platform-specific and out of scope here; tests
/// use recording doubles.
pub trait VirtualMemory {
    /// Whether [`decommit`](Self::decommit) on this platform needs the
    /// identifier recorded at commit time.
    fn requires_release_identifier(&self) -> bool {
        false
    }

    /// Makes the pages of `extent` accessible with `mode` access.
    ///
    /// Returns a [`CommitIdentifier`] only on platforms that require
    /// identifier-based release.
    ///
    /// # Errors
    ///
    /// Fails when the platform cannot back the range; the caller unwinds
    /// its own bookkeeping.
    fn commit(
        &mut self,
        extent: Extent,
        mode: MemoryMode,
        category: MemoryCategory,
    ) -> Result<Option<CommitIdentifier>, CommitError>;

    /// Returns the pages of `extent` to the platform.
    ///
    /// `identifier` is `Some` exactly when
    /// [`requires_release_identifier`](Self::requires_release_identifier)
    /// reports true.
    ///
    /// # Errors
    ///
    /// Fails when the platform cannot release the range. The sparse heap
    /// treats that as an invariant violation.
    fn decommit(
        &mut self,
        extent: Extent,
        identifier: Option<&CommitIdentifier>,
    ) -> Result<(), CommitError>;
}
