//! # Address Tables
//!
//! The ARP and SCTP tables: the sole source of truth for "who is allowed
//! to send from this source". Keyed by value, guarded by independent
//! reader-writer locks, with an identity check on removal so a
//! replacement entry can never be removed by a stale handle.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::addr::{Ipv4Addr4, MacAddress};
use crate::error::TableError;

/// Invoked with the permission-request payload when a container's source
/// IP passes ARP validation on an `open-app` UDP request. See
/// [`crate::broker`].
pub type PermissionCallback = Arc<dyn Fn(Arc<ArpEntry>, crate::broker::PermissionRequest) + Send + Sync>;

/// One resolved container endpoint on the bridge.
pub struct ArpEntry {
    pub ip: Ipv4Addr4,
    pub mac: MacAddress,
    pub permission_callback: Option<PermissionCallback>,
    /// Weak so the table remains the sole strong owner.
    pub container: Option<std::sync::Weak<dyn crate::collaborators::Container>>,
}

impl ArpEntry {
    pub fn new(ip: Ipv4Addr4, mac: MacAddress) -> Self {
        Self {
            ip,
            mac,
            permission_callback: None,
            container: None,
        }
    }
}

/// Invoked with the full SCTP payload (header onward) on a demultiplex hit.
pub type SctpCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub struct SctpEntry {
    pub peer_ip: Ipv4Addr4,
    pub peer_port: u16,
    pub on_packet: SctpCallback,
}

/// A value-keyed, reader-writer-locked table with identity-checked removal.
///
/// `insert`/`remove` take the write lock; `lookup` takes the read lock and
/// returns a clone of the `Arc` so the caller can release the lock before
/// invoking any callback captured inside the entry.
pub struct LockedTable<K, V> {
    inner: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> LockedTable<K, V>
where
    K: std::hash::Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: K, value: Arc<V>) -> Result<(), TableError> {
        let mut guard = self.inner.write().expect("table lock poisoned");
        if guard.contains_key(&key) {
            return Err(TableError::Duplicate);
        }
        guard.insert(key, value);
        Ok(())
    }

    /// Removes `key` only if the stored value is the exact `Arc` passed in
    /// (`Arc::ptr_eq`).
    pub fn remove(&self, key: &K, expected: &Arc<V>) -> Result<Arc<V>, TableError> {
        let mut guard = self.inner.write().expect("table lock poisoned");
        match guard.get(key) {
            Some(existing) if Arc::ptr_eq(existing, expected) => {
                Ok(guard.remove(key).expect("just matched"))
            }
            _ => Err(TableError::NotFound),
        }
    }

    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.inner.read().expect("table lock poisoned");
        guard.get(key).cloned()
    }

    /// Same as [`Self::lookup`] but takes the *write* lock. Used by the
    /// UDP :9998 handler, which mutates nothing but serializes against
    /// concurrent container teardown — kept as a write lock deliberately,
    /// not a read lock.
    pub fn lookup_serialized(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.inner.write().expect("table lock poisoned");
        guard.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for LockedTable<K, V>
where
    K: std::hash::Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// SCTP table key: `(peer IPv4, peer port)`.
pub type SctpKey = (Ipv4Addr4, u16);

pub struct AddressTables {
    pub arp: LockedTable<Ipv4Addr4, ArpEntry>,
    pub sctp: LockedTable<SctpKey, SctpEntry>,
}

impl AddressTables {
    pub fn new() -> Self {
        Self {
            arp: LockedTable::new(),
            sctp: LockedTable::new(),
        }
    }
}

impl Default for AddressTables {
    fn default() -> Self {
        Self::new()
    }
}
