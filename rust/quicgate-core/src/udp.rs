//! UDP ASSOCIATE over QUIC datagrams
//!
//! The application already SOCKS5-wraps every datagram it sends us, and
//! the server is the party holding the egress socket, so the client side
//! is pure pass-through: local datagrams go into the tunnel unchanged and
//! tunnel datagrams come back to whichever local source we saw last.
//! SOCKS5 UDP carries no flow identity on the return path, so
//! last-writer-wins is all there is.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use quicgate_proto::MAX_DATAGRAM_SIZE;

use crate::client::ClientState;
use crate::error::Result;
use crate::socks5::{send_reply, send_reply_with_addr};
use crate::tracker::EgressKind;

/// Read deadline on the local socket; timeouts just retry so the task can
/// observe cancellation.
const INGRESS_READ_DEADLINE: Duration = Duration::from_secs(5);

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;

/// Handle one UDP ASSOCIATE session. The advertised address in the
/// request was already consumed by the handshake and is ignored; the
/// association lives until the controlling TCP socket closes.
pub(crate) async fn handle_associate(
    mut control: TcpStream,
    state: Arc<ClientState>,
) -> Result<()> {
    let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await {
        Ok(socket) => socket,
        Err(e) => {
            send_reply(&mut control, REP_GENERAL_FAILURE).await?;
            return Err(e.into());
        }
    };
    let local_addr = socket.local_addr()?;
    debug!("UDP association bound to {}", local_addr);

    send_reply_with_addr(&mut control, REP_SUCCESS, local_addr).await?;

    let conn = match state.tunnel.current().await {
        Some(conn) => conn,
        None => {
            warn!("UDP association refused: tunnel is down");
            return Ok(());
        }
    };

    let cancel = state.cancel.child_token();
    let socket = Arc::new(socket);
    let last_seen: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let guard = state
        .tracker
        .track(local_addr.to_string(), EgressKind::UdpAssociate);

    // App -> tunnel: forward every local datagram verbatim, remembering
    // where it came from.
    let ingress = {
        let cancel = cancel.clone();
        let socket = Arc::clone(&socket);
        let last_seen = Arc::clone(&last_seen);
        let conn = conn.clone();
        let session = Arc::clone(guard.session());
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = tokio::time::timeout(INGRESS_READ_DEADLINE, socket.recv_from(&mut buf)) => {
                        match received {
                            Err(_) => continue, // deadline, go observe cancellation
                            Ok(Err(e)) => {
                                debug!("UDP ingress read failed: {}", e);
                                break;
                            }
                            Ok(Ok((n, from))) => {
                                *last_seen.lock() = Some(from);
                                match conn.send_datagram(Bytes::copy_from_slice(&buf[..n])) {
                                    Ok(()) => {
                                        session
                                            .upload_counter()
                                            .fetch_add(n as u64, Ordering::Relaxed);
                                    }
                                    Err(quinn::SendDatagramError::ConnectionLost(_)) => break,
                                    // Congestion and size errors drop the
                                    // datagram, never the association.
                                    Err(e) => debug!("datagram send dropped: {}", e),
                                }
                            }
                        }
                    }
                }
            }
        })
    };

    // Tunnel -> app: deliver to the last observed source, drop until one
    // exists.
    let egress = {
        let cancel = cancel.clone();
        let socket = Arc::clone(&socket);
        let last_seen = Arc::clone(&last_seen);
        let conn = conn.clone();
        let session = Arc::clone(guard.session());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    datagram = conn.read_datagram() => {
                        match datagram {
                            Ok(data) => {
                                let target = *last_seen.lock();
                                if let Some(target) = target {
                                    match socket.send_to(&data, target).await {
                                        Ok(n) => {
                                            session
                                                .download_counter()
                                                .fetch_add(n as u64, Ordering::Relaxed);
                                        }
                                        Err(e) => debug!("UDP egress write failed: {}", e),
                                    }
                                }
                            }
                            Err(e) => {
                                debug!("tunnel datagram channel closed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        })
    };

    // Control: the association is bounded by the TCP socket's liveness,
    // or by instance shutdown, whichever comes first.
    let mut sink = [0u8; 512];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = control.read(&mut sink) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {} // stray bytes on the control socket are ignored
                }
            }
        }
    }

    cancel.cancel();
    let _ = tokio::join!(ingress, egress);
    debug!("UDP association on {} closed", local_addr);
    Ok(())
}
