//! transport/tcp.rs
//!
//! Line-oriented TCP transport. The handshake is `HELLO <id> [ro]` answered by
//! `OK` or `ERR <code> <message>`; the heartbeat is `PING` answered by any line.

use async_trait::async_trait;
use bytes::BytesMut;
use memchr::memchr;
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use super::{TransportError, TransportFactory};
use crate::config::GatewayEndpoint;
use crate::shared_types::ClientId;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

/// Gateway error code for "client id already in use".
pub const DEFAULT_COLLISION_CODE: i32 = 326;

const MAX_LINE: usize = 8 * 1024;

// -----------------------------------------------------------------------------
// ----- TcpTransportFactory ---------------------------------------------------

#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    collision_code: i32,
}

impl TcpTransportFactory {
    pub fn new(collision_code: i32) -> Self {
        Self { collision_code }
    }
}

impl Default for TcpTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_COLLISION_CODE)
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    type Transport = TcpTransport;

    async fn open(
        &self,
        endpoint: &GatewayEndpoint,
        client_id: ClientId,
        limit: Duration,
    ) -> Result<TcpTransport, TransportError> {
        timeout(limit, TcpTransport::connect(endpoint, client_id))
            .await
            .map_err(|_| TransportError::Timeout(limit))?
    }

    async fn probe(&self, transport: &TcpTransport, limit: Duration) -> Result<(), TransportError> {
        match timeout(limit, transport.ping()).await {
            Ok(result) => result,
            Err(_) => {
                // A late reply would otherwise answer the next PING.
                transport.connected.store(false, Ordering::Release);
                Err(TransportError::Timeout(limit))
            }
        }
    }

    async fn close(&self, transport: &TcpTransport) {
        transport.shutdown().await;
    }

    fn is_connected(&self, transport: &TcpTransport) -> bool {
        transport.connected.load(Ordering::Acquire)
    }

    fn is_identifier_collision(&self, err: &TransportError) -> bool {
        matches!(err, TransportError::Rejected { code, .. } if *code == self.collision_code)
    }
}

// -----------------------------------------------------------------------------
// ----- TcpTransport ----------------------------------------------------------

#[derive(Debug)]
pub struct TcpTransport {
    client_id: ClientId,
    conn: Mutex<LineConnection>,
    connected: AtomicBool,
}

impl TcpTransport {
    async fn connect(endpoint: &GatewayEndpoint, client_id: ClientId) -> Result<Self, TransportError> {
        let mut conn = LineConnection::connect(&endpoint.addr()).await?;

        let hello = if endpoint.read_only {
            format!("HELLO {client_id} ro\n")
        } else {
            format!("HELLO {client_id}\n")
        };
        conn.send(hello.as_bytes()).await?;

        let reply = conn.read_line().await?;
        parse_handshake(&reply)?;
        debug!(client_id, addr = %endpoint.addr(), "gateway session established");

        Ok(Self {
            client_id,
            conn: Mutex::new(conn),
            connected: AtomicBool::new(true),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// One PING, one reply. A PING whose reply was never read (the caller
    /// gave up waiting) leaves the stream out of step for good, so the
    /// session is marked disconnected instead of trusting the next line.
    async fn ping(&self) -> Result<(), TransportError> {
        let mut conn = self.conn.lock().await;
        if conn.awaiting_reply {
            self.connected.store(false, Ordering::Release);
            return Err(TransportError::Protocol("earlier heartbeat never answered".into()));
        }

        conn.awaiting_reply = true;
        let result = async {
            conn.send(b"PING\n").await?;
            conn.read_line().await.map(|_| ())
        }
        .await;

        match result {
            Ok(()) => conn.awaiting_reply = false,
            Err(_) => self.connected.store(false, Ordering::Release),
        }
        result
    }

    async fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        let mut conn = self.conn.lock().await;
        let _ = conn.send(b"BYE\n").await;
        let _ = conn.stream.shutdown().await;
    }
}

// -----------------------------------------------------------------------------
// ----- LineConnection --------------------------------------------------------

#[derive(Debug)]
struct LineConnection {
    stream: TcpStream,
    buffer: BytesMut,
    // Set between writing a PING and reading its reply.
    awaiting_reply: bool,
}

impl LineConnection {
    async fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(1024),
            awaiting_reply: false,
        })
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = memchr(b'\n', &self.buffer) {
                let line = self.buffer.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line[..pos]);
                return Ok(text.trim_end_matches('\r').to_string());
            }

            if self.buffer.len() > MAX_LINE {
                return Err(TransportError::Protocol("line exceeds 8 KiB".into()));
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Private Utils ---------------------------------------------------------

fn parse_handshake(reply: &str) -> Result<(), TransportError> {
    let reply = reply.trim();
    if reply == "OK" {
        return Ok(());
    }

    let Some(rest) = reply.strip_prefix("ERR") else {
        return Err(TransportError::Protocol(format!("unexpected handshake reply '{reply}'")));
    };

    let rest = rest.trim_start();
    let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
    let code = code
        .parse()
        .map_err(|_| TransportError::Protocol(format!("bad error code in '{reply}'")))?;

    Err(TransportError::Rejected {
        code,
        message: message.to_string(),
    })
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
