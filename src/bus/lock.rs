//! Bus Access Lock
//!
//! One lock per instrument connection. Whoever holds the [`BusGuard`] owns the
//! transport exclusively; initialization, the command dispatcher and the status
//! poller all go through [`BusLock::acquire`], so their bytes never interleave
//! on the wire.
//!
//! Waiters are served in request order (the underlying `tokio::sync::Mutex` is
//! fair). Routines that already hold the bus take `&mut BusGuard` instead of
//! acquiring again; there is no recursive locking.

use crate::error::{BusError, BusResult};
use crate::transport::BusTransport;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

type SharedTransport = Arc<Mutex<Box<dyn BusTransport>>>;

/// Exclusive-access wrapper around one instrument's transport.
#[derive(Clone)]
pub struct BusLock {
    /// Transport, reachable only through a guard
    transport: SharedTransport,
    /// Current owner, for diagnostics
    owner: Arc<SyncMutex<Option<String>>>,
    /// Transport description for logs
    name: Arc<str>,
}

impl BusLock {
    /// Take ownership of `transport`.
    pub fn new(transport: Box<dyn BusTransport>) -> Self {
        let name: Arc<str> = transport.describe().into();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            owner: Arc::new(SyncMutex::new(None)),
            name,
        }
    }

    /// Wait for exclusive ownership of the bus.
    ///
    /// Returns [`BusError::LockTimeout`] if the bus is not granted within
    /// `acquire_timeout`. Ownership is released when the guard is dropped.
    pub async fn acquire(&self, requester: &str, acquire_timeout: Duration) -> BusResult<BusGuard> {
        let guard = timeout(acquire_timeout, self.transport.clone().lock_owned())
            .await
            .map_err(|_| {
                tracing::debug!(
                    bus = %self.name,
                    requester,
                    holder = ?self.current_owner(),
                    "Bus lock acquisition timed out"
                );
                BusError::LockTimeout {
                    requester: requester.to_string(),
                    timeout: acquire_timeout,
                }
            })?;

        *self.owner.lock() = Some(requester.to_string());
        tracing::trace!(bus = %self.name, owner = requester, "Bus lock acquired");

        Ok(BusGuard {
            transport: guard,
            owner_slot: self.owner.clone(),
            owner: requester.to_string(),
        })
    }

    /// Check if the bus is currently free.
    pub fn is_available(&self) -> bool {
        self.transport.try_lock().is_ok()
    }

    /// Who holds the bus right now, if anyone.
    pub fn current_owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    /// Transport description.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// RAII guard for exclusive bus access.
pub struct BusGuard {
    transport: OwnedMutexGuard<Box<dyn BusTransport>>,
    owner_slot: Arc<SyncMutex<Option<String>>>,
    owner: String,
}

impl BusGuard {
    /// The transport, exclusively borrowed for the guard's lifetime.
    pub fn transport(&mut self) -> &mut dyn BusTransport {
        self.transport.as_mut()
    }

    /// Who holds this guard.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl std::fmt::Debug for BusGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusGuard").field("owner", &self.owner).finish()
    }
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        // The owner slot is cleared before the transport guard field drops,
        // so a new holder never sees its name overwritten.
        let mut slot = self.owner_slot.lock();
        if slot.as_deref() == Some(self.owner.as_str()) {
            *slot = None;
        }
        tracing::trace!(owner = %self.owner, "Bus lock released");
    }
}
