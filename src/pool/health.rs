use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use super::pool::PoolInner;
use super::session::PooledSession;
use crate::shared_types::{ClientId, SessionState};
use crate::transport::TransportFactory;

// -----------------------------------------------------------------------------
// ----- HealthReport ----------------------------------------------------------

/// Outcome of one health/idle pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub failed: usize,
    pub evicted_idle: usize,
    pub evicted_unhealthy: usize,
}

// -----------------------------------------------------------------------------
// ----- Background loop -------------------------------------------------------

pub(crate) async fn health_loop<F: TransportFactory>(
    inner: Arc<PoolInner<F>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(inner.settings.health_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; nothing to check yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let report = inner.run_health_check().await;
                if report != HealthReport::default() {
                    debug!(?report, "health pass finished");
                }
            }
        }
    }

    debug!("health loop stopped");
}

// -----------------------------------------------------------------------------
// ----- PoolInner: Health -----------------------------------------------------

impl<F: TransportFactory> PoolInner<F> {
    /// Evicts sessions idle past the idle timeout, then probes every other
    /// idle session. Sessions reaching the failure threshold, or whose
    /// transport reports disconnected, are evicted. Each check runs in its own
    /// task and settles its session as soon as it finishes, so one misbehaving
    /// session neither takes the pass down nor keeps callers waiting.
    pub(crate) async fn run_health_check(self: &Arc<Self>) -> HealthReport {
        let mut report = HealthReport::default();
        let idle_timeout = self.settings.idle_timeout;

        let (expired, claimed) = {
            let mut state = self.state.lock();
            let now = Instant::now();

            let idle_ids: Vec<ClientId> = state
                .sessions
                .values()
                .filter(|s| s.is_idle())
                .map(|s| s.client_id)
                .collect();

            let mut expired = Vec::new();
            let mut claimed = Vec::new();
            for id in idle_ids {
                let Some(session) = state.sessions.get_mut(&id) else {
                    continue;
                };
                if now.saturating_duration_since(session.last_used) > idle_timeout {
                    if let Some(session) = state.detach(id) {
                        expired.push(session);
                    }
                    continue;
                }

                session.probing = true;
                claimed.push((id, session.transport.clone()));
            }
            (expired, claimed)
        };

        for session in expired {
            report.evicted_idle += 1;
            self.dispose(session, "idle timeout").await;
        }

        let checks: Vec<_> = claimed
            .into_iter()
            .map(|(id, transport)| {
                let inner = self.clone();
                let handle = tokio::spawn(async move {
                    let outcome = inner.probe_health(&transport).await;
                    inner.apply_health_outcome(id, outcome)
                });
                (id, handle)
            })
            .collect();

        let mut unhealthy = Vec::new();
        for (id, handle) in checks {
            report.checked += 1;
            let verdict = match handle.await {
                Ok(verdict) => verdict,
                Err(e) => {
                    let failure = HealthFailure::Probe(format!("health check task failed: {e}"));
                    self.apply_health_outcome(id, Err(failure))
                }
            };

            match verdict {
                Verdict::Healthy => report.healthy += 1,
                Verdict::Failing => report.failed += 1,
                Verdict::Evict(session) => {
                    report.failed += 1;
                    unhealthy.push(session);
                }
                Verdict::Gone => {}
            }
        }

        for session in unhealthy {
            report.evicted_unhealthy += 1;
            self.dispose(session, "failed health checks").await;
        }

        // Evictions free capacity for waiters too.
        self.released.notify_waiters();
        self.push_gauges();

        if report.evicted_idle + report.evicted_unhealthy > 0 {
            info!(
                evicted_idle = report.evicted_idle,
                evicted_unhealthy = report.evicted_unhealthy,
                "health pass evicted sessions"
            );
        }
        report
    }

    async fn probe_health(&self, transport: &F::Transport) -> Result<(), HealthFailure> {
        if !self.factory.is_connected(transport) {
            return Err(HealthFailure::Disconnected);
        }

        let limit = self.settings.health_probe_timeout;
        match timeout(limit, self.factory.probe(transport, limit)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HealthFailure::Probe(e.to_string())),
            Err(_) => Err(HealthFailure::Probe(format!("no answer within {limit:?}"))),
        }
    }

    /// Settles one probed session and wakes waiters when it goes back to
    /// idle.
    fn apply_health_outcome(
        &self,
        client_id: ClientId,
        outcome: Result<(), HealthFailure>,
    ) -> Verdict<F::Transport> {
        let verdict = self.settle_probed(client_id, outcome);
        if matches!(verdict, Verdict::Healthy | Verdict::Failing) {
            self.released.notify_waiters();
        }
        verdict
    }

    fn settle_probed(
        &self,
        client_id: ClientId,
        outcome: Result<(), HealthFailure>,
    ) -> Verdict<F::Transport> {
        let max_failures = self.settings.max_health_failures;
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(&client_id) else {
            return Verdict::Gone;
        };
        session.probing = false;

        let outcome = match outcome {
            Ok(()) if !session.state.is_usable() => Err(HealthFailure::Disconnected),
            other => other,
        };

        let failure = match outcome {
            Ok(()) => {
                session.consecutive_health_failures = 0;
                session.last_validated = Instant::now();
                return Verdict::Healthy;
            }
            Err(failure) => failure,
        };

        session.consecutive_health_failures += 1;
        session.metrics.error_count += 1;
        warn!(
            client_id,
            purpose = %session.purpose,
            failures = session.consecutive_health_failures,
            reason = %failure,
            "health check failed"
        );

        let disconnected = matches!(failure, HealthFailure::Disconnected)
            || session.state == SessionState::Disconnected;
        if disconnected || session.consecutive_health_failures >= max_failures {
            if session.state == SessionState::Connected {
                session.transition(SessionState::Failed);
            }
            return match state.detach(client_id) {
                Some(session) => Verdict::Evict(session),
                None => Verdict::Gone,
            };
        }

        Verdict::Failing
    }
}

// -----------------------------------------------------------------------------
// ----- Internal --------------------------------------------------------------

enum Verdict<T> {
    Healthy,
    Failing,
    Evict(PooledSession<T>),
    Gone,
}

#[derive(Debug)]
enum HealthFailure {
    Disconnected,
    Probe(String),
}

impl std::fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthFailure::Disconnected => f.write_str("transport disconnected"),
            HealthFailure::Probe(reason) => f.write_str(reason),
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
