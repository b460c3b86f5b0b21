//! Per-connection UDP egress
//!
//! One unspecified-address UDP socket serves every UDP flow multiplexed on
//! a QUIC connection. Inbound datagrams carry full SOCKS5 UDP packets; the
//! header names the real target and the payload is sent there bare.
//! Replies from any target are wrapped with their source address and
//! returned as datagrams. Per-packet failures drop the packet, never the
//! relay.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quicgate_proto::{encode_udp_packet, parse_udp_packet, Address, MAX_DATAGRAM_SIZE};

/// Run the datagram relay for one QUIC connection until the connection
/// dies or the token fires.
pub async fn relay(conn: quinn::Connection, cancel: CancellationToken) {
    let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            warn!("failed to bind datagram egress socket: {}", e);
            return;
        }
    };
    if let Ok(local) = socket.local_addr() {
        debug!("datagram egress socket bound to {}", local);
    }

    // Client -> target: unwrap and forward.
    let inbound = {
        let conn = conn.clone();
        let socket = Arc::clone(&socket);
        async move {
            loop {
                let data = match conn.read_datagram().await {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("datagram channel closed: {}", e);
                        break;
                    }
                };

                let packet = match parse_udp_packet(&data) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("dropping malformed datagram: {}", e);
                        continue;
                    }
                };

                let target = match resolve(&packet.target).await {
                    Some(target) => target,
                    None => continue,
                };

                if let Err(e) = socket.send_to(packet.payload, target).await {
                    debug!("egress send to {} failed: {}", target, e);
                }
            }
        }
    };

    // Target -> client: wrap with the source address and return.
    let outbound = {
        let conn = conn.clone();
        let socket = Arc::clone(&socket);
        async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (n, source) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("egress socket read failed: {}", e);
                        break;
                    }
                };

                let packet = encode_udp_packet(source, &buf[..n]);
                match conn.send_datagram(packet) {
                    Ok(()) => {}
                    Err(quinn::SendDatagramError::ConnectionLost(_)) => break,
                    Err(e) => debug!("return datagram dropped: {}", e),
                }
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = inbound => {}
        _ = outbound => {}
    }
    debug!("datagram relay stopped");
}

/// Resolve a parsed target to a socket address. Domain resolution failures
/// drop the datagram.
async fn resolve(target: &Address) -> Option<SocketAddr> {
    match target {
        Address::SocketAddr(addr) => Some(*addr),
        Address::DomainName(domain, port) => {
            match tokio::net::lookup_host((domain.as_str(), *port)).await {
                Ok(mut addrs) => addrs.next(),
                Err(e) => {
                    debug!("cannot resolve {}: {}", domain, e);
                    None
                }
            }
        }
    }
}
