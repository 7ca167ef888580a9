//! Proxy→payload registry.
//!
//! Maps each handed-out payload address to the in-heap proxy object that
//! owns it, the payload's (page-rounded) size, and, on platforms that
//! release by identifier, the commit identifier. The payload address is
//! the unique key and is hashed by value: addresses are already
//! well-distributed page-aligned integers, so the map skips mixing them.

use core::fmt;
use core::hash::{BuildHasherDefault, Hasher};

use hashbrown::HashMap;
use log::{error, trace, warn};
use thiserror::Error;

use muon_core::addr::VirtAddr;

use crate::os::CommitIdentifier;

/// Opaque reference to the in-heap proxy object owning a payload.
///
/// The collector later follows this to find the object when it sweeps or
/// moves it; the sparse heap itself never dereferences it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProxyRef(*const ());

impl ProxyRef {
    /// Wraps a pointer to the proxy object.
    pub fn new<T>(ptr: *const T) -> Self {
        Self(ptr.cast())
    }

    /// Returns the raw pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *const () {
        self.0
    }
}

impl fmt::Debug for ProxyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyRef({:#x})", self.0 as usize)
    }
}

/// Error from registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A payload with this address is already registered.
    #[error("payload {0:#x} is already registered")]
    AlreadyRegistered(VirtAddr),
}

#[derive(Debug, Clone, Copy)]
struct PayloadEntry {
    proxy: ProxyRef,
    size: u64,
    identifier: Option<CommitIdentifier>,
}

/// Hashes a payload address by passing its value through unchanged.
#[derive(Default)]
pub struct AddressHasher(u64);

impl Hasher for AddressHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        // Fallback for non-u64 writes; the key type only writes u64s.
        for &byte in bytes {
            self.0 = (self.0 << 8) | u64::from(byte);
        }
    }

    #[inline]
    fn write_u64(&mut self, value: u64) {
        self.0 = value;
    }
}

/// The payload registry: payload address → owning proxy and metadata.
pub struct PayloadRegistry {
    table: HashMap<VirtAddr, PayloadEntry, BuildHasherDefault<AddressHasher>>,
}

impl PayloadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: HashMap::default(),
        }
    }

    /// Records a new payload→proxy mapping.
    ///
    /// # Errors
    ///
    /// A duplicate payload address violates the caller's precondition
    /// and is reported as [`RegistryError::AlreadyRegistered`].
    pub fn remember(
        &mut self,
        payload: VirtAddr,
        proxy: ProxyRef,
        size: u64,
    ) -> Result<(), RegistryError> {
        if self.table.contains_key(&payload) {
            return Err(RegistryError::AlreadyRegistered(payload));
        }
        trace!(
            "remember: payload {payload} -> {proxy:?}, {size:#x} bytes ({} entries)",
            self.table.len()
        );
        self.table.insert(
            payload,
            PayloadEntry {
                proxy,
                size,
                identifier: None,
            },
        );
        Ok(())
    }

    /// Size in bytes recorded for `payload`, or 0 when unknown.
    #[must_use]
    pub fn size_of(&self, payload: VirtAddr) -> u64 {
        self.table.get(&payload).map_or(0, |entry| entry.size)
    }

    /// The proxy currently recorded for `payload`.
    #[must_use]
    pub fn proxy_of(&self, payload: VirtAddr) -> Option<ProxyRef> {
        self.table.get(&payload).map(|entry| entry.proxy)
    }

    /// Removes the entry for `payload`.
    ///
    /// Returns `false` when no entry exists; the caller decides whether
    /// that is worth reporting.
    pub fn forget(&mut self, payload: VirtAddr) -> bool {
        let removed = self.table.remove(&payload).is_some();
        trace!("forget: payload {payload}, removed: {removed}");
        removed
    }

    /// Re-points the entry at a moved proxy object. The payload address
    /// is stable; only the back-reference changes.
    ///
    /// # Panics
    ///
    /// Panics when `payload` is unknown: the collector's tracking is out
    /// of sync with the sparse heap and nothing can be trusted.
    pub fn update_proxy(&mut self, payload: VirtAddr, new_proxy: ProxyRef) {
        let Some(entry) = self.table.get_mut(&payload) else {
            error!("update_proxy: payload {payload} is not registered");
            panic!("update_proxy: payload {payload} is not registered");
        };
        trace!(
            "update_proxy: payload {payload}: {:?} -> {new_proxy:?}",
            entry.proxy
        );
        entry.proxy = new_proxy;
    }

    /// Records the commit identifier for `payload`.
    ///
    /// Returns `false` (and logs) when the payload is unknown.
    pub fn record_identifier(&mut self, payload: VirtAddr, identifier: CommitIdentifier) -> bool {
        let Some(entry) = self.table.get_mut(&payload) else {
            warn!("record_identifier: payload {payload} is not registered");
            return false;
        };
        trace!("record_identifier: payload {payload}: {identifier:?}");
        entry.identifier = Some(identifier);
        true
    }

    /// The commit identifier recorded for `payload`, if any.
    #[must_use]
    pub fn identifier_of(&self, payload: VirtAddr) -> Option<CommitIdentifier> {
        self.table.get(&payload).and_then(|entry| entry.identifier)
    }

    /// Number of registered payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no payload is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for PayloadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;

    fn addr(raw: u64) -> VirtAddr {
        VirtAddr::new(raw)
    }

    fn proxy(raw: usize) -> ProxyRef {
        ProxyRef::new(raw as *const ())
    }

    #[test]
    fn remember_then_query() {
        let mut registry = PayloadRegistry::new();
        registry
            .remember(addr(0x1000_0000), proxy(0x10), 0x2000)
            .unwrap();
        assert_eq!(registry.size_of(addr(0x1000_0000)), 0x2000);
        assert_eq!(registry.proxy_of(addr(0x1000_0000)), Some(proxy(0x10)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_payload_reports_zero_size() {
        let registry = PayloadRegistry::new();
        assert_eq!(registry.size_of(addr(0x1000_0000)), 0);
        assert_eq!(registry.proxy_of(addr(0x1000_0000)), None);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut registry = PayloadRegistry::new();
        registry
            .remember(addr(0x1000_0000), proxy(0x10), 0x1000)
            .unwrap();
        assert_eq!(
            registry.remember(addr(0x1000_0000), proxy(0x20), 0x1000),
            Err(RegistryError::AlreadyRegistered(addr(0x1000_0000)))
        );
        // The original entry is untouched.
        assert_eq!(registry.proxy_of(addr(0x1000_0000)), Some(proxy(0x10)));
    }

    #[test]
    fn forget_reports_absence_softly() {
        let mut registry = PayloadRegistry::new();
        registry
            .remember(addr(0x1000_0000), proxy(0x10), 0x1000)
            .unwrap();
        assert!(registry.forget(addr(0x1000_0000)));
        assert!(!registry.forget(addr(0x1000_0000)));
        assert!(registry.is_empty());
    }

    #[test]
    fn update_proxy_repoints_entry() {
        let mut registry = PayloadRegistry::new();
        registry
            .remember(addr(0x1000_0000), proxy(0x10), 0x1000)
            .unwrap();
        registry.update_proxy(addr(0x1000_0000), proxy(0x20));
        assert_eq!(registry.proxy_of(addr(0x1000_0000)), Some(proxy(0x20)));
        assert_eq!(registry.size_of(addr(0x1000_0000)), 0x1000);
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn update_proxy_on_unknown_payload_is_fatal() {
        let mut registry = PayloadRegistry::new();
        registry.update_proxy(addr(0x1000_0000), proxy(0x20));
    }

    #[test]
    fn identifier_round_trip() {
        let mut registry = PayloadRegistry::new();
        let payload = addr(0x1000_0000);
        registry.remember(payload, proxy(0x10), 0x1000).unwrap();
        assert_eq!(registry.identifier_of(payload), None);

        let id = CommitIdentifier::new(Extent::new(payload, 0x1000), 7);
        assert!(registry.record_identifier(payload, id));
        assert_eq!(registry.identifier_of(payload), Some(id));
    }

    #[test]
    fn identifier_for_unknown_payload_is_soft() {
        let mut registry = PayloadRegistry::new();
        let id = CommitIdentifier::new(Extent::new(addr(0x1000_0000), 0x1000), 7);
        assert!(!registry.record_identifier(addr(0x1000_0000), id));
    }

    #[test]
    fn address_hasher_is_identity_on_u64() {
        let mut hasher = AddressHasher::default();
        hasher.write_u64(0x1234_5678);
        assert_eq!(hasher.finish(), 0x1234_5678);
    }

    #[test]
    fn many_entries_survive_churn() {
        let mut registry = PayloadRegistry::new();
        for i in 0..256u64 {
            registry
                .remember(addr(0x1000_0000 + i * 0x1000), proxy(0x100 + i as usize), 0x1000)
                .unwrap();
        }
        for i in (0..256u64).step_by(2) {
            assert!(registry.forget(addr(0x1000_0000 + i * 0x1000)));
        }
        assert_eq!(registry.len(), 128);
        for i in (1..256u64).step_by(2) {
            assert_eq!(registry.size_of(addr(0x1000_0000 + i * 0x1000)), 0x1000);
        }
    }
}
