//! quicgate egress server
//!
//! Terminates the QUIC tunnel: every accepted bidirectional stream is
//! gated on the bearer token, pointed at its requested destination and
//! spliced; failed credentials get a jittered decoy HTTP error instead of
//! a protocol-shaped rejection. One UDP egress socket per connection
//! relays SOCKS5-framed datagrams in both directions.

pub mod config;
pub mod datagram;
pub mod decoy;
pub mod dispatcher;
pub mod error;

pub use config::ServerConfig;
pub use dispatcher::Server;
pub use error::{Result, ServerError};
