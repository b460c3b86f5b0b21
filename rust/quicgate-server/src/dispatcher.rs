//! Stream dispatcher
//!
//! Accepts QUIC connections and, per connection, runs two long-lived
//! tasks: a bidirectional-stream acceptor and the datagram relay. Each
//! accepted stream is gated on the bearer token within a 5-second
//! deadline, handed its destination, dialed out, and spliced.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use quicgate_proto::{copy_with_pool, framing, BufferPool, STATUS_ERR, STATUS_OK};

use crate::config::{build_endpoint, ServerConfig};
use crate::datagram;
use crate::decoy;
use crate::error::{Result, ServerError};

/// Deadline for the token line at the head of every stream.
const TOKEN_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The running egress server.
pub struct Server {
    endpoint: quinn::Endpoint,
    token: Arc<str>,
    pool: Arc<BufferPool>,
    connections: Arc<DashMap<u64, quinn::Connection>>,
    connection_counter: AtomicU64,
    cancel: CancellationToken,
}

impl Server {
    /// Load the keypair, build the endpoint and bind the listen address.
    /// Every failure here is fatal to startup.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = build_endpoint(&config)?;
        Ok(Self {
            endpoint,
            token: config.token.into(),
            pool: Arc::new(BufferPool::default()),
            connections: Arc::new(DashMap::new()),
            connection_counter: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Number of QUIC connections currently established.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept connections until shutdown.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else { break };
                    let conn_id = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                    let token = Arc::clone(&self.token);
                    let pool = Arc::clone(&self.pool);
                    let connections = Arc::clone(&self.connections);
                    let cancel = self.cancel.child_token();
                    tokio::spawn(async move {
                        match incoming.await {
                            Ok(conn) => {
                                connections.insert(conn_id, conn.clone());
                                handle_connection(conn, token, pool, cancel).await;
                                connections.remove(&conn_id);
                            }
                            Err(e) => debug!("handshake failed: {}", e),
                        }
                    });
                }
            }
        }
        info!("dispatcher stopped");
    }

    /// Idempotent shutdown: cancel every connection task and close the
    /// endpoint with application code 0.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for entry in self.connections.iter() {
            entry.value().close(quinn::VarInt::from_u32(0), b"server shutdown");
        }
        self.connections.clear();
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
    }
}

async fn handle_connection(
    conn: quinn::Connection,
    token: Arc<str>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
) {
    let remote = conn.remote_address();
    info!("connection established from {}", remote);

    let datagrams = tokio::spawn(datagram::relay(conn.clone(), cancel.clone()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            stream = conn.accept_bi() => {
                match stream {
                    Ok((send, recv)) => {
                        let token = Arc::clone(&token);
                        let pool = Arc::clone(&pool);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_stream(recv, send, &token, &pool, &cancel).await {
                                debug!("stream ended: {}", e);
                            }
                        });
                    }
                    Err(quinn::ConnectionError::ApplicationClosed(_))
                    | Err(quinn::ConnectionError::LocallyClosed) => break,
                    Err(e) => {
                        debug!("connection lost: {}", e);
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = datagrams.await;
    info!("connection from {} closed", remote);
}

/// Gate, parse and splice one stream. Generic over the stream halves so
/// the whole state machine runs against in-memory pipes in tests.
pub async fn handle_stream<R, W>(
    mut recv: R,
    mut send: W,
    token: &str,
    pool: &BufferPool,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let line = match tokio::time::timeout(TOKEN_READ_TIMEOUT, framing::read_token_line(&mut recv))
        .await
    {
        Ok(Ok(line)) => line,
        Ok(Err(e)) => {
            decoy::respond(&mut send, cancel).await;
            return Err(e.into());
        }
        Err(_) => {
            decoy::respond(&mut send, cancel).await;
            return Err(ServerError::CredentialTimeout);
        }
    };

    if line.as_bytes() != token.as_bytes() {
        decoy::respond(&mut send, cancel).await;
        return Err(ServerError::AuthFailed);
    }
    framing::write_status(&mut send, STATUS_OK).await?;

    let destination = match framing::read_destination(&mut recv).await {
        Ok(destination) => destination,
        Err(e) => {
            let _ = framing::write_status(&mut send, STATUS_ERR).await;
            return Err(e.into());
        }
    };
    debug!("stream requests {}", destination);

    let remote = match TcpStream::connect(destination.as_str()).await {
        Ok(remote) => remote,
        Err(e) => {
            debug!("dial {} failed: {}", destination, e);
            let _ = framing::write_status(&mut send, STATUS_ERR).await;
            return Err(ServerError::Dial(destination));
        }
    };
    framing::write_status(&mut send, STATUS_OK).await?;

    let (mut remote_read, mut remote_write) = remote.into_split();
    tokio::select! {
        _ = copy_with_pool(pool, &mut recv, &mut remote_write) => {}
        _ = copy_with_pool(pool, &mut remote_read, &mut send) => {}
    }
    debug!("stream to {} finished", destination);
    Ok(())
}
