//! The sparse virtual memory façade.
//!
//! [`SparseVirtualMemory`] composes the free-region [`Pool`], the
//! [`PayloadRegistry`], and a platform [`VirtualMemory`] capability into
//! the interface the collector calls: hand out a committed payload range
//! for a proxy object, release it when the proxy dies, and re-point the
//! registry entry when the proxy moves.

use log::{debug, error, warn};
use thiserror::Error;

use muon_core::addr::VirtAddr;
use muon_core::math::{floor_log2, round_up_to};

use crate::extent::Extent;
use crate::os::{CommitError, CommitIdentifier, MemoryCategory, MemoryMode, VirtualMemory};
use crate::pool::Pool;
use crate::registry::{PayloadRegistry, ProxyRef, RegistryError};

/// Error from sparse heap construction or allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SparseVmemError {
    /// The construction inputs do not describe a usable reservation.
    #[error("invalid sparse heap geometry: {0}")]
    Geometry(&'static str),
    /// The platform refused a commit or decommit.
    #[error(transparent)]
    Commit(#[from] CommitError),
    /// The registry rejected a payload mapping.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Sizes the sparse reservation from the shape of the managed heap.
///
/// With `n = in_heap_size / region_size`, the reservation is
/// `((⌊log₂ n⌋ + 1) · in_heap_size) / 2`, rounded up to the page size: a
/// generous sparse range that costs only address space, not pages.
///
/// # Panics
///
/// Panics if `region_size` is zero or larger than `in_heap_size`, or if
/// `page_size` is zero.
#[must_use]
pub fn reservation_size_for(in_heap_size: u64, region_size: u64, page_size: u64) -> u64 {
    assert!(region_size > 0, "region size must be non-zero");
    assert!(
        in_heap_size >= region_size,
        "heap smaller than a single region"
    );
    let region_count = in_heap_size / region_size;
    let scale = floor_log2(region_count) + 1;
    round_up_to(scale * in_heap_size / 2, page_size)
}

/// Sparse off-heap virtual memory, generic over the platform capability.
pub struct SparseVirtualMemory<V: VirtualMemory> {
    os: V,
    pool: Pool,
    registry: PayloadRegistry,
    page_size: u64,
    category: MemoryCategory,
}

impl<V: VirtualMemory> SparseVirtualMemory<V> {
    /// Creates the façade over an externally reserved address range.
    ///
    /// # Errors
    ///
    /// Rejects geometry that cannot describe a sparse heap: a
    /// non-power-of-two page size, an unaligned base, or a capacity that
    /// is zero or not a page multiple. Nothing is constructed on error.
    pub fn new(
        os: V,
        reservation: Extent,
        page_size: u64,
        category: MemoryCategory,
    ) -> Result<Self, SparseVmemError> {
        if !page_size.is_power_of_two() {
            return Err(SparseVmemError::Geometry(
                "page size must be a power of two",
            ));
        }
        if !reservation.is_page_range(page_size) {
            return Err(SparseVmemError::Geometry(
                "reservation must be a non-empty, page-aligned page multiple",
            ));
        }
        debug!(
            "sparse heap over {reservation:?}, page size {page_size:#x}, category {}",
            category.as_raw()
        );
        Ok(Self {
            os,
            pool: Pool::new(reservation),
            registry: PayloadRegistry::new(),
            page_size,
            category,
        })
    }

    /// Hands out a committed payload range of at least `requested_size`
    /// bytes for `proxy`.
    ///
    /// The size is rounded up to a page multiple; the committed range is
    /// readable and writable.
    ///
    /// # Errors
    ///
    /// Fails when the platform refuses to commit the pages (or, on an
    /// out-of-sync registry, when the address is already mapped). Any
    /// partially applied state is unwound before the error is returned:
    /// the extent goes back to the pool and the registry entry is
    /// removed.
    ///
    /// # Panics
    ///
    /// Panics if `requested_size` is zero, or if the reservation has no
    /// fitting free extent (the reservation is dimensioned so that this
    /// cannot happen).
    pub fn allocate(
        &mut self,
        proxy: ProxyRef,
        requested_size: u64,
    ) -> Result<VirtAddr, SparseVmemError> {
        assert!(requested_size > 0, "allocate: zero-sized payload");
        let size = round_up_to(requested_size, self.page_size);
        let base = self.pool.find_free(size);
        let extent = Extent::new(base, size);

        if let Err(err) = self.registry.remember(base, proxy, size) {
            // Unexpected key state; put the extent back before reporting.
            self.pool.return_extent(extent);
            return Err(err.into());
        }

        match self
            .os
            .commit(extent, MemoryMode::READ | MemoryMode::WRITE, self.category)
        {
            Ok(identifier) => {
                if let Some(identifier) = identifier {
                    self.registry.record_identifier(base, identifier);
                }
                debug!("allocate: {requested_size:#x} bytes -> {extent:?} for {proxy:?}");
                Ok(base)
            }
            Err(err) => {
                warn!("allocate: commit of {extent:?} failed, unwinding");
                self.pool.return_extent(extent);
                if !self.registry.forget(base) {
                    warn!("allocate: no registry entry to unwind for {base}");
                }
                Err(err.into())
            }
        }
    }

    /// Releases the payload at `payload`, decommitting its pages and
    /// returning the range to the pool.
    ///
    /// Returns `false` (and does nothing) when `payload` is not a
    /// registered payload address.
    ///
    /// # Panics
    ///
    /// Panics when the platform fails to decommit, or, on an
    /// identifier-releasing platform, when no identifier was recorded or
    /// the recorded identifier does not match the payload range. The
    /// sparse heap cannot reason about pages it failed to release.
    pub fn release(&mut self, payload: VirtAddr) -> bool {
        let size = self.registry.size_of(payload);
        if size == 0 {
            debug!("release: {payload} is not a registered payload");
            return false;
        }
        debug_assert!(size % self.page_size == 0, "registered size not page-sized");
        let extent = Extent::new(payload, size);

        let identifier = if self.os.requires_release_identifier() {
            let Some(identifier) = self.registry.identifier_of(payload) else {
                error!("release: no commit identifier recorded for {payload}");
                panic!("release: no commit identifier recorded for {payload}");
            };
            assert!(
                identifier.extent() == extent,
                "release: identifier {identifier:?} does not match payload {extent:?}"
            );
            Some(identifier)
        } else {
            None
        };

        if let Err(err) = self.os.decommit(extent, identifier.as_ref()) {
            error!("release: decommit of {extent:?} failed: {err}");
            panic!("release: decommit of {extent:?} failed");
        }

        self.pool.return_extent(extent);
        if !self.registry.forget(payload) {
            warn!("release: no registry entry to forget for {payload}");
        }
        debug!("release: {extent:?} returned to the pool");
        true
    }

    /// Re-points the payload's registry entry at a moved proxy object.
    ///
    /// # Panics
    ///
    /// Panics when `payload` is not registered: the collector's tracking
    /// is out of sync with the sparse heap.
    pub fn update_copied_proxy(&mut self, payload: VirtAddr, new_proxy: ProxyRef) {
        debug!("update_copied_proxy: {payload} -> {new_proxy:?}");
        self.registry.update_proxy(payload, new_proxy);
    }

    /// Records a platform release identifier for `payload`.
    ///
    /// Returns `false` when the payload is unknown.
    pub fn record_release_identifier(
        &mut self,
        payload: VirtAddr,
        identifier: CommitIdentifier,
    ) -> bool {
        self.registry.record_identifier(payload, identifier)
    }

    /// The proxy currently recorded for `payload`.
    #[must_use]
    pub fn proxy_of(&self, payload: VirtAddr) -> Option<ProxyRef> {
        self.registry.proxy_of(payload)
    }

    /// Best-known size of the largest free extent. Advisory.
    #[must_use]
    pub fn largest_free_entry(&self) -> u64 {
        self.pool.largest_free_entry()
    }

    /// Total size of the reservation in bytes.
    #[must_use]
    pub fn reserved_size(&self) -> u64 {
        self.pool.reservation().size()
    }

    /// Bytes currently free in the reservation.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.pool.free_bytes()
    }

    /// Bytes currently handed out as payloads.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.pool.allocated_bytes()
    }

    /// The page size every payload range is a multiple of.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Borrows the platform capability.
    #[must_use]
    pub fn platform(&self) -> &V {
        &self.os
    }
}
