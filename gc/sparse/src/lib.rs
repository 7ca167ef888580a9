//! Sparse off-heap virtual memory for large object payloads.
//!
//! The collector pairs each in-heap proxy object with a payload that
//! lives in a single oversized, sparsely committed virtual address
//! reservation (the *sparse heap*). This crate hands out page-granular
//! address ranges from that reservation, commits physical pages on
//! demand, and releases them when the owning proxy dies.
//!
//! Structure, leaves first:
//!
//! - [`store`] — slab arena for free-list nodes.
//! - [`pool`] — the address-ordered, coalescing free list over the
//!   reservation.
//! - [`registry`] — map from payload address to owning proxy and size.
//! - [`os`] — the platform commit/decommit interface.
//! - [`vmem`] — the [`SparseVirtualMemory`](vmem::SparseVirtualMemory)
//!   façade composing all of the above.
//!
//! The allocator performs no locking: every entry point assumes the
//! caller holds whatever mutator exclusion the surrounding collector
//! provides.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod extent;
pub mod os;
pub mod pool;
pub mod registry;
pub mod store;
pub mod vmem;

pub use extent::Extent;
pub use os::{CommitError, CommitIdentifier, MemoryCategory, MemoryMode, VirtualMemory};
pub use pool::Pool;
pub use registry::{PayloadRegistry, ProxyRef, RegistryError};
pub use vmem::{SparseVirtualMemory, SparseVmemError, reservation_size_for};

pub use muon_core::addr::VirtAddr;
