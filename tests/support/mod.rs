use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use gatecrab::config::{GatewayEndpoint, LimitsTable, PoolSettings, PurposeLimit};
use gatecrab::{
    ClientId, ClientIdRegistry, ConnectionPool, NoopMetrics, Purpose, TransportError,
    TransportFactory,
};

pub const COLLISION_CODE: i32 = 326;

// -----------------------------------------------------------------------------
// ----- Scripted transport ----------------------------------------------------

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Ok,
    Collision,
    Refused,
    Timeout,
    Hang,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    Fail,
    Hang,
}

#[derive(Debug)]
pub struct MockTransport {
    pub client_id: ClientId,
    pub serial: usize,
    connected: Arc<AtomicBool>,
}

/// Shared between the test and the factory the pool owns.
#[derive(Debug, Default)]
pub struct Script {
    open: Mutex<HashMap<ClientId, OpenOutcome>>,
    probes: Mutex<HashMap<ClientId, VecDeque<ProbeOutcome>>>,
    links: Mutex<HashMap<ClientId, Arc<AtomicBool>>>,
    pub open_attempts: Mutex<Vec<ClientId>>,
    pub closed: Mutex<Vec<ClientId>>,
    pub opened: AtomicUsize,
}

#[allow(dead_code)]
impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every open of `id` ends with `outcome` until changed.
    pub fn on_open(&self, id: ClientId, outcome: OpenOutcome) {
        self.open.lock().insert(id, outcome);
    }

    /// Queues probe answers for `id`; once drained, probes succeed.
    pub fn on_probe(&self, id: ClientId, outcomes: &[ProbeOutcome]) {
        self.probes
            .lock()
            .entry(id)
            .or_default()
            .extend(outcomes.iter().copied());
    }

    pub fn disconnect(&self, id: ClientId) {
        if let Some(link) = self.links.lock().get(&id) {
            link.store(false, Ordering::Release);
        }
    }

    pub fn attempts(&self) -> Vec<ClientId> {
        self.open_attempts.lock().clone()
    }

    pub fn closed(&self) -> Vec<ClientId> {
        self.closed.lock().clone()
    }
}

#[derive(Debug, Clone)]
pub struct MockFactory {
    pub script: Arc<Script>,
}

#[async_trait]
impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    async fn open(
        &self,
        _endpoint: &GatewayEndpoint,
        client_id: ClientId,
        limit: Duration,
    ) -> Result<MockTransport, TransportError> {
        self.script.open_attempts.lock().push(client_id);
        let outcome = self
            .script
            .open
            .lock()
            .get(&client_id)
            .copied()
            .unwrap_or(OpenOutcome::Ok);

        match outcome {
            OpenOutcome::Ok => {
                let serial = self.script.opened.fetch_add(1, Ordering::SeqCst);
                let connected = Arc::new(AtomicBool::new(true));
                self.script.links.lock().insert(client_id, connected.clone());
                Ok(MockTransport {
                    client_id,
                    serial,
                    connected,
                })
            }
            OpenOutcome::Collision => Err(TransportError::Rejected {
                code: COLLISION_CODE,
                message: "client id is already in use".into(),
            }),
            OpenOutcome::Refused => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
            OpenOutcome::Timeout => Err(TransportError::Timeout(limit)),
            OpenOutcome::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn probe(&self, transport: &MockTransport, _limit: Duration) -> Result<(), TransportError> {
        let next = self
            .script
            .probes
            .lock()
            .get_mut(&transport.client_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ProbeOutcome::Ok);

        match next {
            ProbeOutcome::Ok => Ok(()),
            ProbeOutcome::Fail => Err(TransportError::Protocol("no heartbeat".into())),
            ProbeOutcome::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn close(&self, transport: &MockTransport) {
        transport.connected.store(false, Ordering::Release);
        self.script.closed.lock().push(transport.client_id);
    }

    fn is_connected(&self, transport: &MockTransport) -> bool {
        transport.connected.load(Ordering::Acquire)
    }

    fn is_identifier_collision(&self, err: &TransportError) -> bool {
        matches!(err, TransportError::Rejected { code, .. } if *code == COLLISION_CODE)
    }
}

// -----------------------------------------------------------------------------
// ----- Builders --------------------------------------------------------------

#[allow(dead_code)]
pub fn fast_settings() -> PoolSettings {
    PoolSettings {
        validation_timeout: Duration::from_millis(100),
        health_probe_timeout: Duration::from_millis(100),
        // Tests drive health passes by hand.
        health_check_interval: Duration::from_secs(3600),
        idle_timeout: Duration::from_secs(3600),
        max_health_failures: 3,
        acquire_timeout: Duration::from_millis(300),
        candidate_span: 20,
    }
}

#[allow(dead_code)]
pub fn fast_endpoint() -> GatewayEndpoint {
    GatewayEndpoint {
        connect_timeout: Duration::from_millis(100),
        ..GatewayEndpoint::default()
    }
}

/// Default table with `purpose` swapped for `limit`.
#[allow(dead_code)]
pub fn limits_with(purpose: Purpose, limit: PurposeLimit) -> LimitsTable {
    let entries: Vec<_> = LimitsTable::default()
        .iter()
        .map(|(p, l)| if p == purpose { (p, limit) } else { (p, l) })
        .collect();
    LimitsTable::new(entries).expect("valid limits")
}

#[allow(dead_code)]
pub fn registry(limits: LimitsTable) -> Arc<ClientIdRegistry> {
    Arc::new(ClientIdRegistry::in_memory(limits, Duration::from_secs(3600)))
}

/// A started pool over the scripted factory.
#[allow(dead_code)]
pub fn started_pool(
    script: &Arc<Script>,
    registry: Arc<ClientIdRegistry>,
    settings: PoolSettings,
) -> ConnectionPool<MockFactory> {
    let pool = ConnectionPool::new(
        MockFactory {
            script: script.clone(),
        },
        registry,
        fast_endpoint(),
        settings,
        Arc::new(NoopMetrics),
    );
    assert!(pool.start());
    pool
}

// -----------------------------------------------------------------------------
// ----- Network ---------------------------------------------------------------

#[allow(dead_code)]
pub fn reserve_port(host: &str) -> u16 {
    let addr = format!("{host}:0");
    let listener = TcpListener::bind(&addr).expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}
