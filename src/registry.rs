//! In-memory tunnel registry: hospital code to live tunnel endpoint.
//!
//! The registry holds references only; it never closes sockets. Shutdown
//! walks the snapshot and signals each session to close itself.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::tunnel::Tunnel;

/// Registration conflict: the code already has a live tunnel.
#[derive(Debug, thiserror::Error)]
#[error("already-registered")]
pub struct AlreadyRegistered;

#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-insert: one registration per code wins exclusively.
    pub fn register(&self, tunnel: Arc<Tunnel>) -> Result<(), AlreadyRegistered> {
        match self.tunnels.entry(tunnel.code.clone()) {
            Entry::Occupied(_) => Err(AlreadyRegistered),
            Entry::Vacant(slot) => {
                slot.insert(tunnel);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, code: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(code).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove only if the entry is still this session's tunnel. A racing
    /// re-registration that already replaced the entry is left alone.
    pub fn unregister(&self, tunnel: &Arc<Tunnel>) {
        self.tunnels
            .remove_if(&tunnel.code, |_, current| Arc::ptr_eq(current, tunnel));
    }

    /// Point-in-time copy for the admin snapshot.
    pub fn snapshot(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }
}
