//! quicgate wire layer
//!
//! Everything the client and server have to agree on byte-for-byte lives
//! here: the SOCKS5-style address codec, the per-stream token and
//! destination framing, and the SOCKS5 UDP packet codec used over QUIC
//! datagrams. The buffer pool backing the relay copy loops also lives here
//! so both processes splice with the same machinery.

pub mod address;
pub mod error;
pub mod framing;
pub mod pool;
pub mod udp;

pub use address::Address;
pub use error::{ProtoError, Result};
pub use framing::{
    read_destination, read_status, read_token_line, write_destination, write_status, write_token,
};
pub use pool::{copy_with_pool, copy_with_pool_counted, BufferPool, PooledBuf, COPY_BUF_SIZE};
pub use udp::{encode_udp_packet, parse_udp_packet, UdpPacket};

/// Stream status byte: operation succeeded.
pub const STATUS_OK: u8 = 0x00;

/// Stream status byte: operation failed, the stream is dead.
pub const STATUS_ERR: u8 = 0x01;

/// Upper bound on the newline-terminated token line, including the newline.
pub const MAX_TOKEN_LINE: usize = 512;

/// Upper bound on a destination address frame (`host:port`).
pub const MAX_ADDR_LEN: usize = 255;

/// Largest UDP payload we ever read or relay.
pub const MAX_DATAGRAM_SIZE: usize = 65535;
