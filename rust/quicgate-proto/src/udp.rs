//! SOCKS5 UDP packet codec (RFC 1928 §7)
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! The client forwards these packets through the tunnel unchanged; the
//! server is the only party that parses and rebuilds them.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;
use std::net::SocketAddr;

use crate::address::Address;
use crate::error::{ProtoError, Result};

/// A parsed SOCKS5 UDP packet, borrowing the payload from the input.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpPacket<'a> {
    pub target: Address,
    pub payload: &'a [u8],
}

/// Parse a SOCKS5 UDP packet. Fragmented packets (`FRAG != 0`) and
/// anything shorter than its header are rejected; callers drop such
/// datagrams without replying.
pub fn parse_udp_packet(data: &[u8]) -> Result<UdpPacket<'_>> {
    if data.len() < 4 {
        return Err(ProtoError::Truncated);
    }
    if data[2] != 0 {
        return Err(ProtoError::Fragmented);
    }

    let mut cursor = Cursor::new(&data[3..]);
    let target = Address::read_from(&mut cursor)?;
    let header_len = 3 + cursor.position() as usize;

    Ok(UdpPacket {
        target,
        payload: &data[header_len..],
    })
}

/// Build a SOCKS5 UDP packet carrying `payload` from `source`, used by the
/// server to return egress traffic to the client.
pub fn encode_udp_packet(source: SocketAddr, payload: &[u8]) -> Bytes {
    let addr = Address::from(source);
    let mut buf = BytesMut::with_capacity(3 + addr.serialized_len() + payload.len());
    buf.put_u16(0); // RSV
    buf.put_u8(0); // FRAG
    addr.write_to(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}
