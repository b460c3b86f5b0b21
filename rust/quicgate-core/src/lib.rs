//! quicgate client core
//!
//! A client-side tunneling proxy: local applications speak SOCKS5 to a
//! loopback listener, and each connection is either dialed directly or
//! carried over a single long-lived QUIC tunnel that looks like HTTP/3
//! from the outside. TCP rides bidirectional streams behind a bearer-token
//! handshake; UDP ASSOCIATE traffic rides QUIC datagrams unchanged.
//!
//! Embedders drive the whole thing through [`start`] / [`stop`] /
//! [`is_running`], or hold a [`ClientHandle`] directly.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod routing;
mod socks5;
pub mod tracker;
pub mod tunnel;
mod udp;

pub use client::{is_running, start, stop, ClientHandle};
pub use config::{ClientConfig, LogLevel, Mode, RuleSource, TransportTuning};
pub use error::{Error, Result};
pub use logging::{clear_logs, get_recent_logs};
pub use routing::SuffixRouter;
pub use tracker::{EgressKind, SessionTracker, TrackedSession};
pub use tunnel::Tunnel;
