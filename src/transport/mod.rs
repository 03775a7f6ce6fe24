//! The seam between the pool and whatever speaks the gateway's wire protocol.
//!
//! The pool only needs to open a session under a client id, prove it answers,
//! and close it. Everything protocol-specific, including how the gateway says
//! "that client id is already connected", lives behind [`TransportFactory`].

pub mod tcp;

use async_trait::async_trait;
use std::{io, time::Duration};
use thiserror::Error;

use crate::config::GatewayEndpoint;
use crate::shared_types::ClientId;

pub use tcp::{TcpTransport, TcpTransportFactory};

// -----------------------------------------------------------------------------
// ----- TransportFactory ------------------------------------------------------

#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Send + Sync + 'static;

    async fn open(
        &self,
        endpoint: &GatewayEndpoint,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<Self::Transport, TransportError>;

    /// Cheap application-level round trip. `Ok` means the session answers,
    /// not merely that the socket is up.
    async fn probe(&self, transport: &Self::Transport, timeout: Duration) -> Result<(), TransportError>;

    async fn close(&self, transport: &Self::Transport);

    fn is_connected(&self, transport: &Self::Transport) -> bool;

    /// Whether `err` is the gateway refusing a client id that another session
    /// already holds. Protocol specific, so the default says no.
    fn is_identifier_collision(&self, _err: &TransportError) -> bool {
        false
    }
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("gateway rejected session (code {code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}
