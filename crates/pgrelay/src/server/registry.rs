//! BackendKeyData → cancellation handle
//!
//! Clients cancel a running query by opening a new connection and sending
//! the pid/secret pair the backend gave them. The proxy relays BackendKeyData
//! unchanged, so the same pair identifies the session that must be cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::protocol::postgres::BackendKeyData;
use crate::server::backend::CancelBackend;

/// Shared map of live sessions, guarded by a single mutex.
///
/// The lock is never held across an await: lookups clone the handle out.
#[derive(Default)]
pub struct KeyDataRegistry {
    entries: Mutex<HashMap<BackendKeyData, Arc<dyn CancelBackend>>>,
}

impl KeyDataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BackendKeyData, Arc<dyn CancelBackend>>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a session. Returns false when the key was already present,
    /// in which case the newer handle replaces it.
    pub fn insert(&self, key: BackendKeyData, canceller: Arc<dyn CancelBackend>) -> bool {
        self.lock().insert(key, canceller).is_none()
    }

    pub fn lookup(&self, key: &BackendKeyData) -> Option<Arc<dyn CancelBackend>> {
        self.lock().get(key).cloned()
    }

    /// Drop the entry for `key` if it still belongs to `canceller`.
    ///
    /// A session whose key was taken over by a newer one leaves the newer
    /// entry in place.
    pub fn remove(&self, key: &BackendKeyData, canceller: &Arc<dyn CancelBackend>) -> bool {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, canceller) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
