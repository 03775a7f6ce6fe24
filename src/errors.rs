use std::time::Duration;
use thiserror::Error;

use crate::shared_types::{ClientId, Purpose};

// -----------------------------------------------------------------------------
// ----- PoolError -------------------------------------------------------------

/// Everything `ConnectionPool::acquire` can surface. Single-candidate failures
/// and single health-check failures are absorbed by the pool and never show
/// up here.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no client id left in the '{purpose}' range")]
    AllocationExhausted { purpose: Purpose },

    #[error("connecting a '{purpose}' session timed out on all {attempts} candidate ids")]
    ConnectTimeout { purpose: Purpose, attempts: usize },

    #[error("gateway refused a '{purpose}' session on all {attempts} candidate ids: {last}")]
    ConnectRejected {
        purpose: Purpose,
        attempts: usize,
        last: String,
    },

    #[error("'{purpose}' sessions connected but never answered the liveness probe ({attempts} candidate ids)")]
    SilentConnection { purpose: Purpose, attempts: usize },

    #[error("'{purpose}' session {client_id} failed validation after one replacement: {reason}")]
    ValidationFailed {
        purpose: Purpose,
        client_id: ClientId,
        reason: String,
    },

    #[error("no '{purpose}' session freed up within {waited:?}")]
    CapacityTimeout { purpose: Purpose, waited: Duration },

    #[error("connection pool is not running")]
    NotRunning,
}

impl PoolError {
    pub fn purpose(&self) -> Option<Purpose> {
        match self {
            PoolError::AllocationExhausted { purpose }
            | PoolError::ConnectTimeout { purpose, .. }
            | PoolError::ConnectRejected { purpose, .. }
            | PoolError::SilentConnection { purpose, .. }
            | PoolError::ValidationFailed { purpose, .. }
            | PoolError::CapacityTimeout { purpose, .. } => Some(*purpose),
            PoolError::NotRunning => None,
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
