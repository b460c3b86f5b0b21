//! SOCKS5 front-end
//!
//! Loopback listener accepting RFC 1928 CONNECT and UDP ASSOCIATE, no
//! authentication methods negotiated. Each accepted connection becomes one
//! session task; CONNECT sessions are routed per-host between direct
//! egress and the QUIC tunnel.

use quinn::VarInt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quicgate_proto::{copy_with_pool_counted, framing, Address, STATUS_OK};

use crate::client::ClientState;
use crate::config::Mode;
use crate::error::{Error, Result};
use crate::tracker::EgressKind;
use crate::udp;

pub(crate) const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

const DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind the loopback listener with `SO_REUSEADDR` so quick restarts do not
/// trip over lingering sockets.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::network(format!("failed to bind {}: {}", addr, e)))?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Accept loop. Exits when the instance token fires; dropping the listener
/// on the way out unblocks any pending accept.
pub(crate) async fn serve(
    listener: TcpListener,
    state: Arc<ClientState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("SOCKS5 listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_session(stream, state).await {
                                debug!("session from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        warn!("accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_session(mut stream: TcpStream, state: Arc<ClientState>) -> Result<()> {
    let (cmd, target) = handshake(&mut stream).await?;

    match cmd {
        CMD_CONNECT => handle_connect(stream, target, state).await,
        CMD_UDP_ASSOCIATE => udp::handle_associate(stream, state).await,
        other => {
            send_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED).await?;
            Err(Error::network(format!("unsupported SOCKS5 command {:#04x}", other)))
        }
    }
}

/// Method negotiation plus request parsing. Offered methods are read and
/// ignored; no-auth is always selected.
pub(crate) async fn handshake<S>(stream: &mut S) -> Result<(u8, Address)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(Error::network("not a SOCKS5 greeting"));
    }

    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(Error::network("bad SOCKS5 request version"));
    }

    let target = Address::read_body(stream, request[3]).await?;
    Ok((request[1], target))
}

fn should_proxy(state: &ClientState, host: &str) -> bool {
    match state.config.mode {
        Mode::Global => !matches!(host, "localhost" | "127.0.0.1" | "::1"),
        Mode::Smart => state.router.should_proxy(host),
    }
}

async fn handle_connect(stream: TcpStream, target: Address, state: Arc<ClientState>) -> Result<()> {
    let host = target.host();
    if should_proxy(&state, &host) {
        debug!("proxy: {}", target);
        proxy_connect(stream, target, state).await
    } else {
        debug!("direct: {}", target);
        direct_connect(stream, target, state).await
    }
}

/// Direct path: dial the target ourselves with a bounded connect timeout
/// and splice.
async fn direct_connect(
    mut stream: TcpStream,
    target: Address,
    state: Arc<ClientState>,
) -> Result<()> {
    let remote = match tokio::time::timeout(
        DIRECT_CONNECT_TIMEOUT,
        TcpStream::connect(target.to_string()),
    )
    .await
    {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
            return Err(e.into());
        }
        Err(_) => {
            send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
            return Err(Error::Timeout("direct connect"));
        }
    };

    send_reply(&mut stream, REP_SUCCESS).await?;

    let guard = state.tracker.track(target.to_string(), EgressKind::Direct);
    let session = guard.session();

    let (mut client_read, mut client_write) = stream.split();
    let (mut remote_read, mut remote_write) = remote.into_split();
    tokio::select! {
        _ = state.cancel.cancelled() => {}
        _ = copy_with_pool_counted(
            &state.pool, &mut client_read, &mut remote_write, session.upload_counter(),
        ) => {}
        _ = copy_with_pool_counted(
            &state.pool, &mut remote_read, &mut client_write, session.download_counter(),
        ) => {}
    }
    Ok(())
}

/// Proxy path: one fresh bidirectional stream on the shared tunnel,
/// authenticated and pointed at the target, then spliced.
async fn proxy_connect(
    mut stream: TcpStream,
    target: Address,
    state: Arc<ClientState>,
) -> Result<()> {
    let conn = match state.tunnel.current().await {
        Some(conn) => conn,
        None => {
            send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
            return Err(Error::TunnelDown);
        }
    };

    let (mut send, mut recv) = match conn.open_bi().await {
        Ok(pair) => pair,
        Err(e) => {
            send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
            return Err(e.into());
        }
    };

    framing::write_token(&mut send, &state.config.token).await?;
    if framing::read_status(&mut recv).await? != STATUS_OK {
        // The server thinks we are a prober; nothing useful to tell the
        // application.
        warn!("tunnel rejected stream credentials");
        return Err(Error::AuthRejected);
    }

    let destination = target.to_string();
    if let Err(e) = framing::write_destination(&mut send, &destination).await {
        send_reply(&mut stream, REP_GENERAL_FAILURE).await?;
        return Err(e.into());
    }
    if framing::read_status(&mut recv).await? != STATUS_OK {
        send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
        return Err(Error::RemoteDial(destination));
    }

    send_reply(&mut stream, REP_SUCCESS).await?;

    let guard = state.tracker.track(destination.clone(), EgressKind::Tunnel);
    let session = guard.session();

    let (mut client_read, mut client_write) = stream.split();
    tokio::select! {
        _ = state.cancel.cancelled() => {}
        _ = copy_with_pool_counted(
            &state.pool, &mut client_read, &mut send, session.upload_counter(),
        ) => {}
        _ = copy_with_pool_counted(
            &state.pool, &mut recv, &mut client_write, session.download_counter(),
        ) => {}
    }

    // Abandon the read side immediately so the stream cannot linger
    // half-open on the connection.
    let _ = recv.stop(VarInt::from_u32(0));
    let _ = send.finish();
    Ok(())
}

/// Standard 10-byte reply with a `0.0.0.0:0` bound address.
pub(crate) async fn send_reply<W>(writer: &mut W, rep: u8) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send_reply_with_addr(writer, rep, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await
}

/// Reply carrying a real bound address (UDP ASSOCIATE needs the port).
pub(crate) async fn send_reply_with_addr<W>(
    writer: &mut W,
    rep: u8,
    bind: SocketAddr,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reply = Vec::with_capacity(22);
    reply.push(SOCKS_VERSION);
    reply.push(rep);
    reply.push(0x00);
    match bind.ip() {
        IpAddr::V4(ip) => {
            reply.push(0x01);
            reply.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            reply.push(0x04);
            reply.extend_from_slice(&ip.octets());
        }
    }
    reply.extend_from_slice(&bind.port().to_be_bytes());
    writer.write_all(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drive_handshake(request: Vec<u8>) -> (Result<(u8, Address)>, Vec<u8>) {
        let (mut app, mut proxy) = tokio::io::duplex(1024);
        app.write_all(&request).await.unwrap();
        let parsed = handshake(&mut proxy).await;
        drop(proxy);
        let mut replies = Vec::new();
        app.read_to_end(&mut replies).await.unwrap();
        (parsed, replies)
    }

    #[tokio::test]
    async fn handshake_parses_domain_connect() {
        let mut wire = vec![0x05, 0x01, 0x00]; // greeting, one method
        wire.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 0x0b]);
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&443u16.to_be_bytes());

        let (parsed, replies) = drive_handshake(wire).await;
        let (cmd, target) = parsed.unwrap();
        assert_eq!(cmd, CMD_CONNECT);
        assert_eq!(target, Address::from_domain("example.com", 443));
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn handshake_parses_ipv4_connect() {
        let mut wire = vec![0x05, 0x02, 0x00, 0x02]; // two methods, both ignored
        wire.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1]);
        wire.extend_from_slice(&8080u16.to_be_bytes());

        let (parsed, _) = drive_handshake(wire).await;
        let (cmd, target) = parsed.unwrap();
        assert_eq!(cmd, CMD_CONNECT);
        assert_eq!(
            target,
            Address::from("127.0.0.1:8080".parse::<SocketAddr>().unwrap())
        );
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_version() {
        let (parsed, replies) = drive_handshake(vec![0x04, 0x01, 0x00]).await;
        assert!(parsed.is_err());
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn reply_encodes_bound_port() {
        let (mut app, mut proxy) = tokio::io::duplex(64);
        send_reply_with_addr(&mut proxy, REP_SUCCESS, "127.0.0.1:4321".parse().unwrap())
            .await
            .unwrap();
        drop(proxy);
        let mut reply = Vec::new();
        app.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[..4], [0x05, 0x00, 0x00, 0x01]);
        assert_eq!(reply[4..8], [127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 4321);
    }
}
