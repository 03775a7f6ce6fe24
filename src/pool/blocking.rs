//! Synchronous entry point for callers that live outside the runtime, such as
//! plain worker threads. It drives the same async pool through a runtime
//! handle; never use it from inside a runtime thread.

use std::sync::Arc;
use tokio::runtime::Handle;

use super::lease::SessionLease;
use super::pool::{ConnectionPool, PoolStatus};
use crate::errors::PoolError;
use crate::shared_types::{ClientId, Purpose};
use crate::transport::TransportFactory;

// -----------------------------------------------------------------------------
// ----- BlockingPool ----------------------------------------------------------

pub struct BlockingPool<F: TransportFactory> {
    pool: Arc<ConnectionPool<F>>,
    handle: Handle,
}

impl<F: TransportFactory> BlockingPool<F> {
    pub fn new(pool: Arc<ConnectionPool<F>>, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Blocks the calling thread until a session is available. The lease
    /// releases on drop like its async counterpart.
    pub fn acquire(
        &self,
        purpose: Purpose,
        owner: &str,
        preferred: Option<ClientId>,
    ) -> Result<SessionLease<F>, PoolError> {
        self.handle
            .block_on(self.pool.acquire(purpose, owner, preferred))
    }

    /// Runs `f` with a leased session and releases it afterwards, whether `f`
    /// returns or panics.
    pub fn with_session<R>(
        &self,
        purpose: Purpose,
        owner: &str,
        f: impl FnOnce(&SessionLease<F>) -> R,
    ) -> Result<R, PoolError> {
        let lease = self.acquire(purpose, owner, None)?;
        Ok(f(&lease))
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }
}
