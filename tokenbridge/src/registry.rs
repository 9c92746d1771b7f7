//! Process-wide registry of foreign handles.
//!
//! Maps a foreign address to a reference-counted owner record so several
//! owners can share one allocation and the free routine runs exactly once.
//!
//! - [`HandleRegistry::register`]: insert a record, or bump its share count.
//! - [`HandleRegistry::release`]: drop one share; the record is erased at 0.
//! - [`Lease`]: an RAII share that registers on construction and releases on drop.
//!
//! The record holds an `Arc<ForeignHandle>`; erasing it drops the registry's
//! strong reference outside the lock. The allocation is freed when the last
//! strong reference anywhere goes away, so a lease that outlives a manual
//! release can never observe freed memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::{ForeignHandle, HandleKind, OwnedKind};
use crate::decoding::Decoding;
use crate::{Error, Result};

/// Key of a registry record: the foreign address plus the kind of handle
/// registered there.
///
/// A batch array and its first row share an address; the kind keeps their
/// records apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleKey {
    address: usize,
    kind: HandleKind,
}

impl HandleKey {
    #[must_use]
    pub fn new(address: usize, kind: HandleKind) -> Self {
        Self { address, kind }
    }

    #[must_use]
    pub fn address(self) -> usize {
        self.address
    }

    #[must_use]
    pub fn kind(self) -> HandleKind {
        self.kind
    }
}

impl fmt::Debug for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleKey({:#x}, {:?})", self.address, self.kind)
    }
}

struct Record {
    payload: Arc<ForeignHandle>,
    shares: usize,
}

type RecordMap = HashMap<HandleKey, Record>;

/// Reference-counted owner records keyed by foreign address.
///
/// Cloning is cheap and yields a handle to the same map, so leases can carry
/// the registry they were taken from.
#[derive(Clone, Default)]
pub struct HandleRegistry {
    inner: Arc<RwLock<RecordMap>>,
}

static GLOBAL: LazyLock<HandleRegistry> = LazyLock::new(HandleRegistry::new);

impl HandleRegistry {
    /// Create an empty, private registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    #[must_use]
    pub fn global() -> &'static HandleRegistry {
        &GLOBAL
    }

    // No operation leaves the map half-updated, so a poisoned lock is safe
    // to keep using.
    fn read(&self) -> RwLockReadGuard<'_, RecordMap> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RecordMap> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one share of `handle`.
    ///
    /// The first registration of an address inserts a record with count 1;
    /// later ones increment the count and return the same key.
    pub fn register(&self, handle: &Arc<ForeignHandle>) -> HandleKey {
        let key = HandleKey::new(handle.address(), handle.kind());
        let mut map = self.write();
        match map.get_mut(&key) {
            Some(record) => {
                if !Arc::ptr_eq(&record.payload, handle) {
                    tracing::warn!(
                        address = key.address,
                        kind = ?key.kind,
                        "address registered again under a different owner; keeping the first"
                    );
                }
                record.shares += 1;
                tracing::trace!(address = key.address, shares = record.shares, "handle retained");
            }
            None => {
                map.insert(
                    key,
                    Record {
                        payload: Arc::clone(handle),
                        shares: 1,
                    },
                );
                tracing::trace!(address = key.address, kind = ?key.kind, "handle registered");
            }
        }
        key
    }

    /// Drop one share of `key`.
    ///
    /// Returns `false` if the key is not registered.
    pub fn release(&self, key: HandleKey) -> bool {
        let erased = {
            let mut map = self.write();
            let Some(record) = map.get_mut(&key) else {
                return false;
            };
            record.shares -= 1;
            tracing::trace!(address = key.address, shares = record.shares, "handle released");
            if record.shares == 0 {
                map.remove(&key)
            } else {
                None
            }
        };
        // Free routine (if this was the last strong ref) runs unlocked.
        if let Some(record) = erased {
            tracing::debug!(address = key.address, kind = ?key.kind, "handle record erased");
            drop(record);
        }
        true
    }

    /// Bump the count of an existing record, returning its payload.
    fn retain(&self, key: HandleKey) -> Option<Arc<ForeignHandle>> {
        let mut map = self.write();
        let record = map.get_mut(&key)?;
        record.shares += 1;
        Some(Arc::clone(&record.payload))
    }

    /// Current share count of `key`.
    #[must_use]
    pub fn share_count(&self, key: HandleKey) -> Option<usize> {
        self.read().get(&key).map(|r| r.shares)
    }

    /// Kind of the live record under `key`.
    #[must_use]
    pub fn kind(&self, key: HandleKey) -> Option<HandleKind> {
        self.read().get(&key).map(|r| r.payload.kind())
    }

    /// Payload of the record under `key`, without touching its count.
    #[must_use]
    pub fn lookup(&self, key: HandleKey) -> Option<Arc<ForeignHandle>> {
        self.read().get(&key).map(|r| Arc::clone(&r.payload))
    }

    #[must_use]
    pub fn contains(&self, key: HandleKey) -> bool {
        self.read().contains_key(&key)
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Rebuild a text view over a registered string allocation.
    ///
    /// Takes a new share of the record.
    ///
    /// # Errors
    /// Returns [`Error::HandleNotFound`] if `key` is not registered, or
    /// [`Error::Unsupported`] if it does not hold a string.
    pub fn to_decoding(&self, key: HandleKey) -> Result<Decoding> {
        match key.kind {
            HandleKind::Owned(OwnedKind::String) => {}
            HandleKind::Owned(
                OwnedKind::Encoding | OwnedKind::EncodingArray | OwnedKind::Tokenizer,
            )
            | HandleKind::Parented => {
                return Err(Error::Unsupported(format!(
                    "{:?} record has no text view",
                    key.kind
                )))
            }
        }
        let lease = Lease::acquire(self, key).ok_or(Error::HandleNotFound(key.address))?;
        Ok(Decoding::from_lease(Arc::new(lease)))
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("records", &self.len())
            .finish()
    }
}

/// One registered share of a foreign handle, released on drop.
///
/// Views produced by the backends hold a lease (usually behind an `Arc`, so
/// sibling views share it) for as long as they borrow the handle's memory.
pub struct Lease {
    registry: HandleRegistry,
    key: HandleKey,
    handle: Arc<ForeignHandle>,
}

impl Lease {
    /// Register `handle` in `registry` and hold that share.
    #[must_use]
    pub fn new(registry: &HandleRegistry, handle: Arc<ForeignHandle>) -> Self {
        let key = registry.register(&handle);
        Self {
            registry: registry.clone(),
            key,
            handle,
        }
    }

    /// Take another share of a record that is already registered.
    ///
    /// Check and increment happen under one lock, so this cannot revive a
    /// record another thread is erasing.
    #[must_use]
    pub fn acquire(registry: &HandleRegistry, key: HandleKey) -> Option<Self> {
        let handle = registry.retain(key)?;
        Some(Self {
            registry: registry.clone(),
            key,
            handle,
        })
    }

    #[must_use]
    pub fn key(&self) -> HandleKey {
        self.key
    }

    #[must_use]
    pub fn handle(&self) -> &Arc<ForeignHandle> {
        &self.handle
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.registry.release(self.key) {
            // Only reachable if someone released this share by hand.
            tracing::warn!(address = self.key.address, "lease outlived its registry record");
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("kind", &self.handle.kind())
            .finish()
    }
}
