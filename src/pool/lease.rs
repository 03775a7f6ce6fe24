use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::pool::PoolInner;
use super::session::PooledSession;
use crate::registry::ClientIdRegistry;
use crate::shared_types::{ClientId, Purpose};
use crate::transport::TransportFactory;

// -----------------------------------------------------------------------------
// ----- SessionLease ----------------------------------------------------------

/// Scoped hold on a pooled session. The session stays marked in use until the
/// lease drops, whichever way the holder's scope ends (return, `?`, panic, or
/// the future being cancelled).
pub struct SessionLease<F: TransportFactory> {
    pool: Arc<PoolInner<F>>,
    client_id: ClientId,
    purpose: Purpose,
    transport: Arc<F::Transport>,
    armed: bool,
}

impl<F: TransportFactory> SessionLease<F> {
    pub(crate) fn new(
        pool: Arc<PoolInner<F>>,
        client_id: ClientId,
        purpose: Purpose,
        transport: Arc<F::Transport>,
    ) -> Self {
        Self {
            pool,
            client_id,
            purpose,
            transport,
            armed: true,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn transport(&self) -> &F::Transport {
        &self.transport
    }

    pub fn record_request(&self) {
        self.update_metrics(|m| m.request_count += 1);
    }

    pub fn record_error(&self) {
        self.update_metrics(|m| m.error_count += 1);
    }

    /// Explicit form of dropping the lease.
    pub fn release(self) {}

    /// Disarms the drop-time release and hands back the client id. The caller
    /// takes over responsibility for the session's pool entry.
    pub(crate) fn forget(mut self) -> ClientId {
        self.armed = false;
        self.client_id
    }

    fn update_metrics(&self, f: impl FnOnce(&mut super::session::SessionMetrics)) {
        let mut state = self.pool.state.lock();
        if let Some(session) = state.sessions.get_mut(&self.client_id) {
            f(&mut session.metrics);
            session.metrics.last_activity = tokio::time::Instant::now();
        }
    }
}

impl<F: TransportFactory> Deref for SessionLease<F> {
    type Target = F::Transport;

    fn deref(&self) -> &Self::Target {
        &self.transport
    }
}

impl<F: TransportFactory> fmt::Debug for SessionLease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("client_id", &self.client_id)
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

impl<F: TransportFactory> Drop for SessionLease<F> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.client_id);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SlotReservation -------------------------------------------------------

/// One unit of a purpose's cap held for a creation in flight. Dropping it
/// unfulfilled gives the unit back and wakes waiters.
pub(crate) struct SlotReservation<F: TransportFactory> {
    pool: Arc<PoolInner<F>>,
    purpose: Purpose,
    armed: bool,
}

impl<F: TransportFactory> SlotReservation<F> {
    pub(crate) fn new(pool: Arc<PoolInner<F>>, purpose: Purpose) -> Self {
        Self {
            pool,
            purpose,
            armed: true,
        }
    }

    pub(crate) fn purpose(&self) -> Purpose {
        self.purpose
    }

    /// Swaps the reservation for the session it was held for, already in use.
    pub(crate) fn fulfil(mut self, session: PooledSession<F::Transport>) -> SessionLease<F> {
        let client_id = session.client_id;
        let transport = session.transport.clone();
        {
            let mut state = self.pool.state.lock();
            state.release_slot(self.purpose);
            state.insert(session);
        }
        self.armed = false;

        SessionLease::new(self.pool.clone(), client_id, self.purpose, transport)
    }
}

impl<F: TransportFactory> Drop for SlotReservation<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.pool.state.lock().release_slot(self.purpose);
        self.pool.released.notify_waiters();
    }
}

// -----------------------------------------------------------------------------
// ----- ReservedId ------------------------------------------------------------

/// A client id allocated for a candidate connect. Returned to the registry on
/// drop unless [`keep`](Self::keep) is called.
pub(crate) struct ReservedId {
    registry: Arc<ClientIdRegistry>,
    client_id: ClientId,
    owner: String,
    armed: bool,
}

impl ReservedId {
    pub(crate) fn new(registry: Arc<ClientIdRegistry>, client_id: ClientId, owner: &str) -> Self {
        Self {
            registry,
            client_id,
            owner: owner.to_string(),
            armed: true,
        }
    }

    pub(crate) fn keep(mut self) -> ClientId {
        self.armed = false;
        self.client_id
    }
}

impl Drop for ReservedId {
    fn drop(&mut self) {
        if self.armed {
            self.registry.deallocate(self.client_id, &self.owner);
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
