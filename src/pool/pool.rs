use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use super::lease::{ReservedId, SessionLease, SlotReservation};
use super::session::{PooledSession, SessionInfo};
use crate::config::{GatewayEndpoint, LimitsTable, PoolSettings};
use crate::errors::PoolError;
use crate::metrics::{Counter, Gauge, MetricsSink};
use crate::registry::ClientIdRegistry;
use crate::shared_types::{ClientId, Purpose, SessionState};
use crate::transport::TransportFactory;

// -----------------------------------------------------------------------------
// ----- ConnectionPool --------------------------------------------------------

/// Bounded set of reusable gateway sessions, capped per purpose.
///
/// Construct once at startup, share behind an `Arc`, and drive the lifecycle
/// explicitly with [`start`](Self::start) / [`stop`](Self::stop).
pub struct ConnectionPool<F: TransportFactory> {
    inner: Arc<PoolInner<F>>,
    health_task: Mutex<Option<HealthTask>>,
}

struct HealthTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub(crate) struct PoolInner<F: TransportFactory> {
    pub(crate) factory: F,
    pub(crate) registry: Arc<ClientIdRegistry>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) endpoint: GatewayEndpoint,
    pub(crate) settings: PoolSettings,
    pub(crate) limits: LimitsTable,
    pub(crate) state: Mutex<PoolState<F::Transport>>,
    // Woken whenever a session or a creation slot frees up.
    pub(crate) released: Notify,
    pub(crate) running: AtomicBool,
}

/// Mutated only inside short critical sections that never await.
pub(crate) struct PoolState<T> {
    pub(crate) sessions: HashMap<ClientId, PooledSession<T>>,
    pub(crate) by_purpose: HashMap<Purpose, BTreeSet<ClientId>>,
    // Creations in flight per purpose; they count against the cap.
    pub(crate) pending: HashMap<Purpose, usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurposeStatus {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub pending: usize,
    pub healthy: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub running: bool,
    pub endpoint: String,
    pub per_purpose: BTreeMap<Purpose, PurposeStatus>,
    pub total_sessions: usize,
    pub total_in_use: usize,
    pub settings: PoolSettings,
}

enum Claim<F: TransportFactory> {
    Idle(SessionLease<F>),
    Create(SlotReservation<F>),
    Full,
}

#[derive(Debug)]
enum CandidateFailure {
    Timeout,
    Collision(String),
    Silent,
    Fatal(String),
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Static ------------------------------------------------

impl<F: TransportFactory> ConnectionPool<F> {
    pub fn new(
        factory: F,
        registry: Arc<ClientIdRegistry>,
        endpoint: GatewayEndpoint,
        settings: PoolSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let limits = registry.limits().clone();
        let inner = PoolInner {
            factory,
            registry,
            metrics,
            endpoint,
            settings,
            limits,
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                by_purpose: HashMap::new(),
                pending: HashMap::new(),
            }),
            released: Notify::new(),
            running: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
            health_task: Mutex::new(None),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Lifecycle ---------------------------------------------

impl<F: TransportFactory> ConnectionPool<F> {
    /// Starts the background health/idle loop. Must be called from inside a
    /// tokio runtime. Returns `false` if the pool was already running.
    pub fn start(&self) -> bool {
        let mut task = self.health_task.lock();
        if task.is_some() {
            return false;
        }

        self.inner.running.store(true, Ordering::Release);
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(super::health::health_loop(self.inner.clone(), rx));
        *task = Some(HealthTask { shutdown, handle });

        info!(
            endpoint = %self.inner.endpoint.addr(),
            interval = ?self.inner.settings.health_check_interval,
            "connection pool started"
        );
        true
    }

    /// Stops the health loop, then closes and deallocates every pooled
    /// session before returning. Safe to call more than once.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);

        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                error!("health loop ended abnormally: {e}");
            }
        }

        let drained: Vec<_> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<_> = state.sessions.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.detach(id))
                .collect()
        };

        let closed = drained.len();
        for session in drained {
            self.inner.dispose(session, "pool shutdown").await;
        }
        self.inner.released.notify_waiters();

        info!(closed, "connection pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// ----- ConnectionPool: Public ------------------------------------------------

impl<F: TransportFactory> ConnectionPool<F> {
    /// Hands out a live, validated session for `purpose`. The returned lease
    /// marks the session in use until it is dropped.
    pub async fn acquire(
        &self,
        purpose: Purpose,
        owner: &str,
        preferred: Option<ClientId>,
    ) -> Result<SessionLease<F>, PoolError> {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }

        let waited = self.inner.settings.acquire_timeout;
        let deadline = Instant::now() + waited;

        loop {
            // Register interest before looking, so a release between the
            // claim and the wait is not lost.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.inner.claim(purpose, owner, preferred) {
                Claim::Idle(lease) => return self.inner.validate_and_hand_out(lease, owner, preferred).await,
                Claim::Create(slot) => {
                    let lease = self.inner.create_session(slot, owner, preferred).await?;
                    return Ok(self.inner.hand_out(lease, owner));
                }
                Claim::Full => {
                    debug!(%purpose, owner, "purpose at capacity; waiting for a release");
                    if timeout_at(deadline, notified).await.is_err() {
                        warn!(%purpose, owner, ?waited, "timed out waiting for a free session");
                        return Err(PoolError::CapacityTimeout { purpose, waited });
                    }
                    if !self.is_running() {
                        return Err(PoolError::NotRunning);
                    }
                }
            }
        }
    }

    /// Transport-level disconnect callback. The next health pass evicts it.
    pub fn on_transport_disconnected(&self, client_id: ClientId) {
        let mut state = self.inner.state.lock();
        if let Some(session) = state.sessions.get_mut(&client_id) {
            if session.transition(SessionState::Disconnected) {
                info!(client_id, purpose = %session.purpose, "gateway session disconnected");
            }
        }
    }

    pub async fn run_health_check(&self) -> super::health::HealthReport {
        self.inner.run_health_check().await
    }

    pub fn status(&self) -> PoolStatus {
        let per_purpose = self.inner.purpose_status();
        PoolStatus {
            running: self.is_running(),
            endpoint: self.inner.endpoint.addr(),
            total_sessions: per_purpose.values().map(|s| s.total).sum(),
            total_in_use: per_purpose.values().map(|s| s.in_use).sum(),
            per_purpose,
            settings: self.inner.settings.clone(),
        }
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.inner.state.lock();
        let mut sessions: Vec<_> = state.sessions.values().map(PooledSession::info).collect();
        sessions.sort_by_key(|s| s.client_id);
        sessions
    }

    pub fn registry(&self) -> &Arc<ClientIdRegistry> {
        &self.inner.registry
    }
}

// -----------------------------------------------------------------------------
// ----- PoolInner: Acquisition ------------------------------------------------

impl<F: TransportFactory> PoolInner<F> {
    /// The reuse-or-create decision. One critical section, no I/O: either
    /// claim an idle session, reserve a creation slot under the cap, or report
    /// the purpose full.
    fn claim(self: &Arc<Self>, purpose: Purpose, owner: &str, preferred: Option<ClientId>) -> Claim<F> {
        let cap = self.limits.get(purpose).max_concurrent;
        let max_failures = self.settings.max_health_failures;

        let (claim, doomed) = {
            let mut state = self.state.lock();

            let ids: Vec<ClientId> = state
                .by_purpose
                .get(&purpose)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();

            // Idle sessions that fail the local check free their slot now
            // rather than waiting for the next health pass.
            let mut doomed = Vec::new();
            let mut idle = Vec::new();
            for id in ids {
                let Some(session) = state.sessions.get(&id) else {
                    continue;
                };
                if !session.is_idle() {
                    continue;
                }
                if session.looks_healthy(max_failures) && self.factory.is_connected(&session.transport) {
                    idle.push(id);
                } else if let Some(session) = state.detach(id) {
                    doomed.push(session);
                }
            }

            let pick = preferred
                .filter(|id| idle.contains(id))
                .or_else(|| idle.first().copied());

            let claim = if let Some(id) = pick {
                let session = state
                    .sessions
                    .get_mut(&id)
                    .filter(|s| s.is_idle());
                match session {
                    Some(session) => {
                        session.in_use = true;
                        Claim::Idle(SessionLease::new(
                            self.clone(),
                            id,
                            purpose,
                            session.transport.clone(),
                        ))
                    }
                    None => Claim::Full,
                }
            } else if state.count(purpose) < cap {
                *state.pending.entry(purpose).or_default() += 1;
                Claim::Create(SlotReservation::new(self.clone(), purpose))
            } else {
                Claim::Full
            };

            (claim, doomed)
        };

        if !doomed.is_empty() {
            let inner = self.clone();
            tokio::spawn(async move {
                for session in doomed {
                    inner.dispose(session, "failed local health check").await;
                }
            });
        }

        if let Claim::Idle(lease) = &claim {
            debug!(client_id = lease.client_id(), %purpose, owner, "reusing idle session");
        }
        claim
    }

    /// Probe a reused session before handing it out. One failure buys exactly
    /// one replacement; a second failure surfaces to the caller.
    async fn validate_and_hand_out(
        self: &Arc<Self>,
        lease: SessionLease<F>,
        owner: &str,
        preferred: Option<ClientId>,
    ) -> Result<SessionLease<F>, PoolError> {
        let limit = self.settings.validation_timeout;
        let probe = timeout(limit, self.factory.probe(lease.transport(), limit)).await;

        let reason = match probe {
            Ok(Ok(())) => {
                self.mark_validated(lease.client_id());
                return Ok(self.hand_out(lease, owner));
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("liveness probe timed out after {limit:?}"),
        };

        let purpose = lease.purpose();
        let client_id = lease.client_id();
        self.metrics.incr(Counter::ValidationFailures, purpose);
        warn!(client_id, %purpose, owner, %reason, "pooled session failed validation; replacing");

        let (session, slot) = self.detach_for_replacement(lease);
        if let Some(session) = session {
            self.dispose(session, "failed validation").await;
        }

        match self.create_session(slot, owner, preferred).await {
            Ok(replacement) => Ok(self.hand_out(replacement, owner)),
            Err(e) => Err(PoolError::ValidationFailed {
                purpose,
                client_id,
                reason: format!("{reason}; replacement failed: {e}"),
            }),
        }
    }

    /// Removes the leased session and reserves its slot for a replacement in
    /// the same critical section, so no other caller can take the slot.
    fn detach_for_replacement(
        self: &Arc<Self>,
        lease: SessionLease<F>,
    ) -> (Option<PooledSession<F::Transport>>, SlotReservation<F>) {
        let purpose = lease.purpose();
        let client_id = lease.forget();

        let mut state = self.state.lock();
        let session = state.detach(client_id);
        *state.pending.entry(purpose).or_default() += 1;
        (session, SlotReservation::new(self.clone(), purpose))
    }

    pub(crate) fn hand_out(&self, lease: SessionLease<F>, owner: &str) -> SessionLease<F> {
        {
            let mut state = self.state.lock();
            if let Some(session) = state.sessions.get_mut(&lease.client_id()) {
                let now = Instant::now();
                session.owner_label = owner.to_string();
                session.last_used = now;
                session.metrics.last_activity = now;
            }
        }

        self.registry.touch(lease.client_id());
        debug!(client_id = lease.client_id(), purpose = %lease.purpose(), owner, "session handed out");
        lease
    }

    fn mark_validated(&self, client_id: ClientId) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(&client_id) {
            session.last_validated = Instant::now();
            session.consecutive_health_failures = 0;
        }
    }

    pub(crate) fn release(self: &Arc<Self>, client_id: ClientId) {
        let orphan = {
            let mut state = self.state.lock();
            match state.sessions.get_mut(&client_id) {
                Some(session) => {
                    let now = Instant::now();
                    session.in_use = false;
                    session.last_used = now;
                    session.metrics.last_activity = now;

                    if self.running.load(Ordering::Acquire) {
                        None
                    } else {
                        state.detach(client_id)
                    }
                }
                None => None,
            }
        };

        // Created while the pool was stopping; nobody else will close it.
        if let Some(session) = orphan {
            self.dispose_detached(session);
        }
        self.released.notify_waiters();
    }
}

// -----------------------------------------------------------------------------
// ----- PoolInner: Creation ---------------------------------------------------

impl<F: TransportFactory> PoolInner<F> {
    /// Walks candidate ids (the preferred one first, then the purpose range in
    /// ascending order) until one connects and answers the liveness probe.
    /// Per-candidate failures are absorbed; only exhausting the list fails.
    pub(crate) async fn create_session(
        self: &Arc<Self>,
        slot: SlotReservation<F>,
        owner: &str,
        preferred: Option<ClientId>,
    ) -> Result<SessionLease<F>, PoolError> {
        let purpose = slot.purpose();
        let candidates = self.candidates(purpose, preferred);

        let mut tried = HashSet::new();
        let mut last = None;
        let mut exhausted = false;

        for candidate in candidates {
            if tried.contains(&candidate) {
                continue;
            }

            let Some(id) = self.registry.allocate(purpose, owner, Some(candidate)) else {
                exhausted = true;
                break;
            };
            // Dropped (and so deallocated) unless the session is kept.
            let reserved = ReservedId::new(self.registry.clone(), id, owner);
            if !tried.insert(id) {
                continue;
            }

            match self.connect_candidate(purpose, id).await {
                Ok(transport) => {
                    let session = PooledSession::connected(id, purpose, transport, owner);
                    let lease = slot.fulfil(session);
                    reserved.keep();
                    self.metrics.incr(Counter::SessionsCreated, purpose);
                    info!(client_id = id, %purpose, owner, "created gateway session");
                    return Ok(lease);
                }
                Err(CandidateFailure::Fatal(reason)) => {
                    self.metrics.incr(Counter::SessionsFailed, purpose);
                    error!(client_id = id, %purpose, %reason, "gateway connect failed");
                    return Err(PoolError::ConnectRejected {
                        purpose,
                        attempts: tried.len(),
                        last: reason,
                    });
                }
                Err(failure) => {
                    self.metrics.incr(Counter::SessionsFailed, purpose);
                    last = Some(failure);
                }
            }
        }

        let attempts = tried.len();
        let err = match last {
            _ if exhausted && attempts == 0 => PoolError::AllocationExhausted { purpose },
            None => PoolError::AllocationExhausted { purpose },
            Some(CandidateFailure::Timeout) => PoolError::ConnectTimeout { purpose, attempts },
            Some(CandidateFailure::Collision(last)) | Some(CandidateFailure::Fatal(last)) => {
                PoolError::ConnectRejected {
                    purpose,
                    attempts,
                    last,
                }
            }
            Some(CandidateFailure::Silent) => PoolError::SilentConnection { purpose, attempts },
        };
        error!(%purpose, owner, attempts, "could not create gateway session: {err}");
        Err(err)
    }

    fn candidates(&self, purpose: Purpose, preferred: Option<ClientId>) -> Vec<ClientId> {
        let held: HashSet<ClientId> = self.state.lock().sessions.keys().copied().collect();
        let span = self.settings.candidate_span as usize;

        preferred
            .into_iter()
            .chain(self.limits.get(purpose).ids().take(span))
            .filter(|id| !held.contains(id))
            .fold(Vec::new(), |mut out, id| {
                if !out.contains(&id) {
                    out.push(id);
                }
                out
            })
    }

    async fn connect_candidate(
        &self,
        purpose: Purpose,
        client_id: ClientId,
    ) -> Result<Arc<F::Transport>, CandidateFailure> {
        let connect_limit = self.endpoint.connect_timeout;
        let opened = timeout(
            connect_limit,
            self.factory.open(&self.endpoint, client_id, connect_limit),
        )
        .await;

        let transport = match opened {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) if self.factory.is_identifier_collision(&e) => {
                info!(client_id, %purpose, "client id already in use at the gateway; trying next");
                return Err(CandidateFailure::Collision(e.to_string()));
            }
            Ok(Err(e)) if e.is_timeout() => {
                warn!(client_id, %purpose, "connect timed out; trying next id");
                return Err(CandidateFailure::Timeout);
            }
            Ok(Err(e)) => return Err(CandidateFailure::Fatal(e.to_string())),
            Err(_) => {
                warn!(client_id, %purpose, ?connect_limit, "connect timed out; trying next id");
                return Err(CandidateFailure::Timeout);
            }
        };

        let probe_limit = self.settings.validation_timeout;
        match timeout(probe_limit, self.factory.probe(&transport, probe_limit)).await {
            Ok(Ok(())) => Ok(Arc::new(transport)),
            outcome => {
                let reason = match outcome {
                    Ok(Err(e)) => e.to_string(),
                    _ => format!("no answer within {probe_limit:?}"),
                };
                warn!(client_id, %purpose, %reason, "silent connection; discarding and trying next id");
                self.factory.close(&transport).await;
                Err(CandidateFailure::Silent)
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PoolInner: Eviction ---------------------------------------------------

impl<F: TransportFactory> PoolInner<F> {
    /// Closes a session already detached from the pool maps and returns its
    /// client id to the registry.
    pub(crate) async fn dispose(&self, mut session: PooledSession<F::Transport>, reason: &str) {
        session.transition(SessionState::Closing);
        self.factory.close(&session.transport).await;
        self.registry.deallocate(session.client_id, &session.allocated_by);
        self.metrics.incr(Counter::SessionsEvicted, session.purpose);
        info!(
            client_id = session.client_id,
            purpose = %session.purpose,
            reason,
            "evicted gateway session"
        );
    }

    /// Drop-path variant of [`dispose`](Self::dispose): closes on the runtime
    /// when there is one, otherwise just returns the client id.
    pub(crate) fn dispose_detached(self: &Arc<Self>, session: PooledSession<F::Transport>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.clone();
                handle.spawn(async move {
                    inner.dispose(session, "released after shutdown").await;
                });
            }
            Err(_) => {
                self.registry.deallocate(session.client_id, &session.allocated_by);
                self.metrics.incr(Counter::SessionsEvicted, session.purpose);
            }
        }
    }

    pub(crate) fn purpose_status(&self) -> BTreeMap<Purpose, PurposeStatus> {
        let max_failures = self.settings.max_health_failures;
        let state = self.state.lock();

        let mut out: BTreeMap<Purpose, PurposeStatus> = self
            .limits
            .iter()
            .map(|(purpose, limit)| {
                let status = PurposeStatus {
                    pending: state.pending.get(&purpose).copied().unwrap_or(0),
                    max_concurrent: limit.max_concurrent,
                    ..Default::default()
                };
                (purpose, status)
            })
            .collect();

        for session in state.sessions.values() {
            let status = out.entry(session.purpose).or_default();
            status.total += 1;
            if session.in_use {
                status.in_use += 1;
            } else {
                status.idle += 1;
            }
            if session.looks_healthy(max_failures) && session.consecutive_health_failures == 0 {
                status.healthy += 1;
            }
        }
        out
    }

    pub(crate) fn push_gauges(&self) {
        for (purpose, status) in self.purpose_status() {
            self.metrics.gauge(Gauge::Total, purpose, status.total as u64);
            self.metrics.gauge(Gauge::Active, purpose, status.in_use as u64);
            self.metrics.gauge(Gauge::Healthy, purpose, status.healthy as u64);
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PoolState -------------------------------------------------------------

impl<T> PoolState<T> {
    /// Sessions plus in-flight creations for `purpose`.
    pub(crate) fn count(&self, purpose: Purpose) -> usize {
        let live = self.by_purpose.get(&purpose).map_or(0, BTreeSet::len);
        live + self.pending.get(&purpose).copied().unwrap_or(0)
    }

    pub(crate) fn insert(&mut self, session: PooledSession<T>) {
        self.by_purpose
            .entry(session.purpose)
            .or_default()
            .insert(session.client_id);
        self.sessions.insert(session.client_id, session);
    }

    /// Removes a session from every map.
    pub(crate) fn detach(&mut self, client_id: ClientId) -> Option<PooledSession<T>> {
        let session = self.sessions.remove(&client_id)?;
        if let Some(ids) = self.by_purpose.get_mut(&session.purpose) {
            ids.remove(&client_id);
        }
        Some(session)
    }

    pub(crate) fn release_slot(&mut self, purpose: Purpose) {
        if let Some(pending) = self.pending.get_mut(&purpose) {
            *pending = pending.saturating_sub(1);
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
