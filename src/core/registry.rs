//! Registry of live backend connections.
//!
//! Maps each [`IdentityHash`] to the one connection currently serving it.
//! Entries are `Arc`s compared by pointer, so a connection that has been
//! superseded can never remove its successor. Critical sections only touch
//! the map; draining and closing happen outside the lock.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::core::identity::IdentityHash;

/// Thread-safe `IdentityHash -> Arc<C>` map with atomic replacement.
#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    conns: RwLock<HashMap<IdentityHash, Arc<C>>>,
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
        }
    }

    /// Current connection for `identity`, if any.
    pub fn lookup(&self, identity: &IdentityHash) -> Option<Arc<C>> {
        self.read().get(identity).cloned()
    }

    /// Install `conn` for `identity`, returning whatever it replaced.
    ///
    /// The swap is a single map insert under the write lock, so readers see
    /// either the old or the new connection and never a gap.
    pub fn publish(&self, identity: IdentityHash, conn: Arc<C>) -> Option<Arc<C>> {
        self.write().insert(identity, conn)
    }

    /// Remove the entry for `identity` only if it is still exactly `expected`.
    pub fn remove(&self, identity: &IdentityHash, expected: &Arc<C>) -> bool {
        let mut conns = self.write();
        match conns.get(identity) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                conns.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Whether `conn` is the connection currently registered for `identity`.
    pub fn is_current(&self, identity: &IdentityHash, conn: &Arc<C>) -> bool {
        self.read()
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current, conn))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Identities with a registered connection, in no particular order.
    pub fn identities(&self) -> Vec<IdentityHash> {
        self.read().keys().copied().collect()
    }

    // The map is only ever left in a consistent state, so a poisoned lock is
    // still safe to use.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<IdentityHash, Arc<C>>> {
        self.conns.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<IdentityHash, Arc<C>>> {
        self.conns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
