//! Address-ordered free list over the sparse reservation.
//!
//! [`Pool`] tracks the currently unallocated ranges of the reservation
//! as a singly linked list of [`FreeNode`]s, ordered strictly by
//! ascending base address. Allocation is first-fit; release reinserts
//! the range and merges it with touching neighbours in the same call, so
//! the list never holds two adjacent extents. Both walks are O(N) in the
//! number of free extents, which coalescing keeps bounded by the
//! live-payload count rather than the allocation history.
//!
//! The largest-free counters are advisory: they are refreshed
//! opportunistically during release walks and decremented on allocation,
//! and may lag the true state.

use log::trace;

use muon_core::addr::VirtAddr;

use crate::extent::Extent;
use crate::store::{NodeIndex, NodeStore};

/// The free-region pool of the sparse heap.
///
/// Constructed with a single node spanning the whole reservation. At
/// every externally observable moment the list is strictly ascending in
/// address, every node lies inside the reservation, and no node touches
/// another (touching extents are always merged).
pub struct Pool {
    nodes: NodeStore,
    /// Head of the address-ordered list. `None` only in the transient
    /// state where the entire reservation is handed out at once.
    head: Option<NodeIndex>,
    reservation: Extent,
    free_bytes: u64,
    free_node_count: usize,
    /// Best-known largest free extent size. Advisory.
    approx_largest_free: u64,
    /// Base of the extent behind `approx_largest_free`. Advisory.
    largest_free_base: Option<VirtAddr>,
}

impl Pool {
    /// Creates a pool whose free list covers all of `reservation`.
    ///
    /// # Panics
    ///
    /// Panics if `reservation` is empty.
    #[must_use]
    pub fn new(reservation: Extent) -> Self {
        assert!(reservation.size() > 0, "empty reservation");
        let mut nodes = NodeStore::new();
        let head = nodes.acquire(reservation, None);
        Self {
            nodes,
            head: Some(head),
            reservation,
            free_bytes: reservation.size(),
            free_node_count: 1,
            approx_largest_free: reservation.size(),
            largest_free_base: Some(reservation.base()),
        }
    }

    /// Returns the base of the first (lowest-address) free extent of at
    /// least `size` bytes, removing the range from the free list.
    ///
    /// `size` must be a positive page multiple; the caller rounds.
    ///
    /// # Panics
    ///
    /// Panics if no free extent fits. The reservation is dimensioned so
    /// that this cannot happen; running out is an invariant violation,
    /// not a recoverable error.
    pub fn find_free(&mut self, size: u64) -> VirtAddr {
        assert!(size > 0, "find_free: zero-sized request");
        assert!(self.head.is_some(), "find_free: free list is empty");

        let mut previous: Option<NodeIndex> = None;
        let mut current = self.head;
        while let Some(index) = current {
            if self.nodes.node(index).extent.size() >= size {
                break;
            }
            previous = Some(index);
            current = self.nodes.node(index).next;
        }

        let Some(found) = current else {
            panic!(
                "find_free: no free extent of {size:#x} bytes (free {:#x} of {:#x})",
                self.free_bytes,
                self.reservation.size()
            );
        };

        let found_extent = self.nodes.node(found).extent;
        let base = found_extent.base();
        if found_extent.size() == size {
            // Exact fit: unlink the node and return it to the store.
            let next = self.nodes.node(found).next;
            match previous {
                None => self.head = next,
                Some(prev) => self.nodes.node_mut(prev).next = next,
            }
            self.nodes.release(found);
            self.free_node_count -= 1;
        } else {
            // Partial fit: consume the front of the node in place.
            let shrunk = found_extent.split_front(size);
            self.nodes.node_mut(found).extent = shrunk;
            if self.largest_free_base == Some(base) {
                self.approx_largest_free = self.approx_largest_free.saturating_sub(size);
                self.largest_free_base = Some(shrunk.base());
            }
        }

        self.free_bytes -= size;
        trace!(
            "find_free: {size:#x} bytes at {base}, {} free nodes",
            self.free_node_count
        );
        base
    }

    /// Reinserts a range previously produced by [`find_free`](Self::find_free),
    /// merging it with touching neighbours.
    ///
    /// # Panics
    ///
    /// Panics if the extent is not a well-formed range inside the
    /// reservation, or if it overlaps a range that is already free. Both
    /// are caller bugs the sparse heap cannot recover from.
    pub fn return_extent(&mut self, extent: Extent) {
        assert!(extent.size() > 0, "return_extent: empty extent");
        assert!(
            self.reservation.contains_extent(extent),
            "return_extent: {extent:?} outside the reservation {:?}",
            self.reservation
        );

        // Find the first node whose base is above the returned range,
        // refreshing the largest-free hint from every node scanned.
        let mut previous: Option<NodeIndex> = None;
        let mut current = self.head;
        while let Some(index) = current {
            let node_extent = self.nodes.node(index).extent;
            if node_extent.size() > self.approx_largest_free {
                self.approx_largest_free = node_extent.size();
                self.largest_free_base = Some(node_extent.base());
            }
            if extent.base() < node_extent.base() {
                break;
            }
            previous = Some(index);
            current = self.nodes.node(index).next;
        }

        match previous {
            None => self.insert_at_head(extent, current),
            Some(prev) => self.insert_after(prev, extent, current),
        }

        self.free_bytes += extent.size();
        trace!(
            "return_extent: {extent:?}, {} free nodes, {:#x} bytes free",
            self.free_node_count, self.free_bytes
        );
    }

    /// Insert below the current head (or into an empty list).
    fn insert_at_head(&mut self, extent: Extent, successor: Option<NodeIndex>) {
        let Some(succ) = successor else {
            // The whole reservation was handed out in one extent and is
            // now coming back; reinstall it as the head.
            let index = self.nodes.acquire(extent, None);
            self.head = Some(index);
            self.free_node_count += 1;
            return;
        };

        let succ_extent = self.nodes.node(succ).extent;
        assert!(
            !extent.overlaps(succ_extent),
            "return_extent: {extent:?} overlaps free {succ_extent:?}"
        );
        if extent.abuts(succ_extent) {
            // Head-coalesce: grow the successor downwards.
            self.nodes.node_mut(succ).extent =
                Extent::new(extent.base(), extent.size() + succ_extent.size());
        } else {
            let index = self.nodes.acquire(extent, Some(succ));
            self.head = Some(index);
            self.free_node_count += 1;
        }
    }

    /// Insert between `prev` and `successor`, coalescing with either or
    /// both.
    fn insert_after(&mut self, prev: NodeIndex, extent: Extent, successor: Option<NodeIndex>) {
        let prev_extent = self.nodes.node(prev).extent;
        assert!(
            prev_extent.end() <= extent.base(),
            "return_extent: {extent:?} overlaps free {prev_extent:?}"
        );
        let merges_prev = prev_extent.abuts(extent);
        let merges_succ = successor
            .is_some_and(|succ| extent.abuts(self.nodes.node(succ).extent));

        match (merges_prev, merges_succ) {
            (true, true) => {
                // The returned range bridges both neighbours; the
                // successor collapses into the predecessor.
                let succ = successor.expect("successor merge without a successor");
                let succ_node = *self.nodes.node(succ);
                self.nodes.node_mut(prev).extent = Extent::new(
                    prev_extent.base(),
                    prev_extent.size() + extent.size() + succ_node.extent.size(),
                );
                self.nodes.node_mut(prev).next = succ_node.next;
                self.nodes.release(succ);
                self.free_node_count -= 1;
            }
            (true, false) => {
                self.nodes.node_mut(prev).extent =
                    Extent::new(prev_extent.base(), prev_extent.size() + extent.size());
            }
            (false, true) => {
                let succ = successor.expect("successor merge without a successor");
                let succ_extent = self.nodes.node(succ).extent;
                self.nodes.node_mut(succ).extent =
                    Extent::new(extent.base(), extent.size() + succ_extent.size());
            }
            (false, false) => {
                if let Some(succ) = successor {
                    let succ_extent = self.nodes.node(succ).extent;
                    assert!(
                        extent.end() < succ_extent.base(),
                        "return_extent: {extent:?} overlaps free {succ_extent:?}"
                    );
                }
                let index = self.nodes.acquire(extent, successor);
                self.nodes.node_mut(prev).next = Some(index);
                self.free_node_count += 1;
            }
        }
    }

    /// Best-known size of the largest free extent. Advisory; may lag the
    /// true state.
    #[must_use]
    pub fn largest_free_entry(&self) -> u64 {
        self.approx_largest_free
    }

    /// Overwrites the largest-free hint (the collector recomputes it at
    /// the end of a global cycle).
    pub fn set_largest_free_entry(&mut self, size: u64) {
        self.approx_largest_free = size;
    }

    /// Sum of the sizes of all free extents.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Bytes currently handed out of the reservation.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.reservation.size() - self.free_bytes
    }

    /// Number of nodes in the free list.
    #[must_use]
    pub fn free_node_count(&self) -> usize {
        self.free_node_count
    }

    /// The reservation this pool allocates from.
    #[must_use]
    pub fn reservation(&self) -> Extent {
        self.reservation
    }

    /// Iterates the free extents in ascending address order.
    pub fn free_extents(&self) -> impl Iterator<Item = Extent> + '_ {
        core::iter::successors(self.head, |&index| self.nodes.node(index).next)
            .map(|index| self.nodes.node(index).extent)
    }
}
