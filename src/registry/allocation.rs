use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::shared_types::{ClientId, Purpose};

// -----------------------------------------------------------------------------
// ----- Allocation ------------------------------------------------------------

/// One client id handed out by the registry. Timestamps are unix seconds so
/// the on-disk snapshot stays readable by older tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    #[serde(rename = "id")]
    pub client_id: ClientId,
    pub purpose: Purpose,
    pub allocated_at: f64,
    pub allocated_by: String,
    pub last_seen: f64,
    pub active: bool,
    pub use_count: u64,
}

impl Allocation {
    pub(crate) fn new(client_id: ClientId, purpose: Purpose, owner: &str, now: f64) -> Self {
        Self {
            client_id,
            purpose,
            allocated_at: now,
            allocated_by: owner.to_string(),
            last_seen: now,
            active: true,
            use_count: 0,
        }
    }

    pub fn age_since_seen(&self, now: f64) -> Duration {
        Duration::from_secs_f64((now - self.last_seen).max(0.0))
    }

    /// Inactive and unseen for longer than `stale_after`.
    pub fn is_stale(&self, now: f64, stale_after: Duration) -> bool {
        !self.active && self.age_since_seen(now) > stale_after
    }
}

// -----------------------------------------------------------------------------
// ----- Clock -----------------------------------------------------------------

pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
