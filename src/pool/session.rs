use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::shared_types::{ClientId, Purpose, SessionState};

// -----------------------------------------------------------------------------
// ----- SessionMetrics --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMetrics {
    pub created_at: Instant,
    pub connected_at: Option<Instant>,
    pub last_activity: Instant,
    pub reconnect_count: u64,
    pub request_count: u64,
    pub error_count: u64,
}

impl SessionMetrics {
    fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            connected_at: None,
            last_activity: now,
            reconnect_count: 0,
            request_count: 0,
            error_count: 0,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PooledSession ---------------------------------------------------------

/// One live gateway session owned by the pool. The registry never sees this,
/// only the client id it was allocated under.
#[derive(Debug)]
pub(crate) struct PooledSession<T> {
    pub(crate) client_id: ClientId,
    pub(crate) purpose: Purpose,
    pub(crate) transport: Arc<T>,
    pub(crate) state: SessionState,
    pub(crate) allocated_by: String,
    pub(crate) owner_label: String,
    pub(crate) last_used: Instant,
    pub(crate) last_validated: Instant,
    pub(crate) in_use: bool,
    // Held by a health pass; not handed out, not counted as in use.
    pub(crate) probing: bool,
    pub(crate) consecutive_health_failures: u32,
    pub(crate) metrics: SessionMetrics,
}

impl<T> PooledSession<T> {
    /// A session whose transport just connected and answered the probe.
    pub(crate) fn connected(
        client_id: ClientId,
        purpose: Purpose,
        transport: Arc<T>,
        owner: &str,
    ) -> Self {
        let now = Instant::now();
        let mut session = Self {
            client_id,
            purpose,
            transport,
            state: SessionState::Disconnected,
            allocated_by: owner.to_string(),
            owner_label: owner.to_string(),
            last_used: now,
            last_validated: now,
            in_use: true,
            probing: false,
            consecutive_health_failures: 0,
            metrics: SessionMetrics::new(now),
        };
        session.transition(SessionState::Connecting);
        session.transition(SessionState::Connected);
        session.metrics.connected_at = Some(now);
        session
    }

    pub(crate) fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                client_id = self.client_id,
                from = self.state.as_str(),
                to = next.as_str(),
                "ignoring invalid session state transition"
            );
            return false;
        }
        if self.state == SessionState::Reconnecting && next == SessionState::Connected {
            self.metrics.reconnect_count += 1;
        }
        self.state = next;
        true
    }

    /// Free for a caller: neither leased nor under a health check.
    pub(crate) fn is_idle(&self) -> bool {
        !self.in_use && !self.probing
    }

    /// Local check only: no network round trip.
    pub(crate) fn looks_healthy(&self, max_failures: u32) -> bool {
        self.state.is_usable() && self.consecutive_health_failures < max_failures
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            client_id: self.client_id,
            purpose: self.purpose,
            state: self.state,
            owner_label: self.owner_label.clone(),
            in_use: self.in_use,
            probing: self.probing,
            consecutive_health_failures: self.consecutive_health_failures,
            idle_for: self.last_used.elapsed(),
            since_validated: self.last_validated.elapsed(),
            metrics: self.metrics,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionInfo -----------------------------------------------------------

/// Read-only view of a pooled session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client_id: ClientId,
    pub purpose: Purpose,
    pub state: SessionState,
    pub owner_label: String,
    pub in_use: bool,
    pub probing: bool,
    pub consecutive_health_failures: u32,
    pub idle_for: Duration,
    pub since_validated: Duration,
    pub metrics: SessionMetrics,
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
