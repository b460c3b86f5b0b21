//! Client configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Routing mode for the SOCKS5 front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Proxy only hosts matched by the rule set; everything else dials out
    /// directly.
    #[default]
    Smart,
    /// Proxy everything except loopback targets.
    Global,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "smart" => Ok(Self::Smart),
            "global" => Ok(Self::Global),
            other => Err(Error::config(format!("unknown mode '{}'", other))),
        }
    }
}

/// Log verbosity, mapped onto `tracing` levels at init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "silent" | "off" => Ok(Self::Silent),
            "error" => Ok(Self::Error),
            "warning" | "warn" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(Error::config(format!("unknown log level '{}'", other))),
        }
    }
}

/// Where routing rules come from: a file on disk (missing file means an
/// empty rule set) or inline newline-separated text handed over by an
/// embedding SDK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    File(PathBuf),
    Inline(String),
}

/// QUIC transport tuning. The defaults are sized for high-latency,
/// slightly lossy international paths and match what the server expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportTuning {
    /// Effectively-infinite idle timeout; the keep-alive probes are what
    /// actually hold the path open.
    #[serde(default = "defaults::idle_timeout", with = "serde_secs")]
    pub idle_timeout: Duration,

    #[serde(default = "defaults::keep_alive_interval", with = "serde_secs")]
    pub keep_alive_interval: Duration,

    #[serde(default = "defaults::max_concurrent_streams")]
    pub max_concurrent_streams: u32,

    #[serde(default = "defaults::stream_receive_window")]
    pub stream_receive_window: u32,

    #[serde(default = "defaults::receive_window")]
    pub receive_window: u32,

    #[serde(default = "defaults::send_window")]
    pub send_window: u64,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            idle_timeout: defaults::idle_timeout(),
            keep_alive_interval: defaults::keep_alive_interval(),
            max_concurrent_streams: defaults::max_concurrent_streams(),
            stream_receive_window: defaults::stream_receive_window(),
            receive_window: defaults::receive_window(),
            send_window: defaults::send_window(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tunnel server as `host:port`.
    pub server_addr: String,

    /// Bearer token presented at the head of every proxied stream.
    pub token: String,

    /// Local SOCKS5 port on loopback. Zero binds an ephemeral port.
    #[serde(default = "defaults::local_port")]
    pub local_port: u16,

    #[serde(default)]
    pub mode: Mode,

    /// SNI to present; falls back to the host part of `server_addr`.
    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub rules: Option<RuleSource>,

    /// Extra PEM trust anchors merged into the system roots. Mobile
    /// platforms without a usable native store ship their bundle here.
    #[serde(default)]
    pub ca_bundle: Option<PathBuf>,

    /// Skip server certificate verification. Development only; a
    /// production tunnel with this set is indistinguishable from a
    /// man-in-the-middle's.
    #[serde(default)]
    pub skip_cert_verify: bool,

    #[serde(default)]
    pub transport: TransportTuning,

    #[serde(default)]
    pub log_level: LogLevel,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            token: token.into(),
            local_port: defaults::local_port(),
            mode: Mode::default(),
            server_name: None,
            rules: None,
            ca_bundle: None,
            skip_cert_verify: false,
            transport: TransportTuning::default(),
            log_level: LogLevel::default(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.token.trim().is_empty() {
            return Err(Error::config("token must not be empty"));
        }
        if self.server_host().is_none() {
            return Err(Error::config(format!(
                "server address '{}' is not host:port",
                self.server_addr
            )));
        }
        Ok(())
    }

    /// Host part of `server_addr`, brackets stripped for IPv6 literals.
    pub fn server_host(&self) -> Option<String> {
        let (host, _port) = self.server_addr.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(host.trim_start_matches('[').trim_end_matches(']').to_string())
    }

    /// The SNI actually presented on the wire.
    pub fn effective_server_name(&self) -> Option<String> {
        self.server_name.clone().or_else(|| self.server_host())
    }
}

mod defaults {
    use std::time::Duration;

    pub fn local_port() -> u16 {
        1080
    }

    pub fn idle_timeout() -> Duration {
        // A year; reconnect decisions belong to the supervisor, not the
        // transport.
        Duration::from_secs(365 * 24 * 60 * 60)
    }

    pub fn keep_alive_interval() -> Duration {
        Duration::from_secs(10)
    }

    pub fn max_concurrent_streams() -> u32 {
        5000
    }

    pub fn stream_receive_window() -> u32 {
        6 * 1024 * 1024
    }

    pub fn receive_window() -> u32 {
        15 * 1024 * 1024
    }

    pub fn send_window() -> u64 {
        15 * 1024 * 1024
    }
}

mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_tunnel_contract() {
        let tuning = TransportTuning::default();
        assert_eq!(tuning.keep_alive_interval, Duration::from_secs(10));
        assert!(tuning.idle_timeout >= Duration::from_secs(365 * 24 * 60 * 60));
        assert_eq!(tuning.max_concurrent_streams, 5000);
        assert_eq!(tuning.stream_receive_window, 6 * 1024 * 1024);
        assert_eq!(tuning.receive_window, 15 * 1024 * 1024);
    }

    #[test]
    fn mode_parses() {
        assert_eq!("smart".parse::<Mode>().unwrap(), Mode::Smart);
        assert_eq!("GLOBAL".parse::<Mode>().unwrap(), Mode::Global);
        assert!("tunnel-all".parse::<Mode>().is_err());
    }

    #[test]
    fn server_host_handles_ipv6_brackets() {
        let mut config = ClientConfig::new("[2001:db8::1]:443", "t");
        assert_eq!(config.server_host().as_deref(), Some("2001:db8::1"));
        config.server_addr = "gate.example.net:443".into();
        assert_eq!(config.server_host().as_deref(), Some("gate.example.net"));
        assert_eq!(
            config.effective_server_name().as_deref(),
            Some("gate.example.net")
        );
        config.server_name = Some("cdn.example.com".into());
        assert_eq!(
            config.effective_server_name().as_deref(),
            Some("cdn.example.com")
        );
    }

    #[test]
    fn validate_rejects_bad_input() {
        assert!(ClientConfig::new("gate.example.net:443", "  ").validate().is_err());
        assert!(ClientConfig::new("no-port", "token").validate().is_err());
        assert!(ClientConfig::new("gate.example.net:443", "token").validate().is_ok());
    }
}
