//! Server configuration and QUIC endpoint construction

use quinn::{crypto::rustls::QuicServerConfig, Endpoint, IdleTimeout, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, ServerError};

/// Server configuration, populated from command-line flags.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TLS certificate chain, PEM.
    pub cert: PathBuf,
    /// TLS private key, PEM.
    pub key: PathBuf,
    /// Bearer token every stream must present.
    pub token: String,
    /// UDP listen address.
    pub listen: SocketAddr,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(ServerError::config("token must not be empty"));
        }
        Ok(())
    }
}

/// Load the PEM keypair. Unreadable or empty files are startup errors;
/// the process has nothing useful to do without them.
pub fn load_keypair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ServerError::config(format!("cannot read certificate {}: {}", cert_path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            ServerError::config(format!("bad certificate {}: {}", cert_path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(ServerError::config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_pem = std::fs::read(key_path).map_err(|e| {
        ServerError::config(format!("cannot read private key {}: {}", key_path.display(), e))
    })?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| ServerError::config(format!("bad private key {}: {}", key_path.display(), e)))?
        .ok_or_else(|| {
            ServerError::config(format!("no private key found in {}", key_path.display()))
        })?;

    Ok((certs, key))
}

/// Build the listening endpoint: keypair, ALPN `h3`, tunnel transport
/// parameters, bound to the configured UDP address.
pub fn build_endpoint(config: &ServerConfig) -> Result<Endpoint> {
    let (certs, key) = load_keypair(&config.cert, &config.key)?;

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    tls.alpn_protocols = vec![b"h3".to_vec()];

    let crypto: QuicServerConfig = tls
        .try_into()
        .map_err(|e| ServerError::config(format!("QUIC TLS config rejected: {}", e)))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(build_transport()?));

    Ok(Endpoint::server(server_config, config.listen)?)
}

/// Mirror of the client's transport tuning: keep-alives carry liveness,
/// the idle timeout never fires on its own.
fn build_transport() -> Result<quinn::TransportConfig> {
    let idle = IdleTimeout::try_from(Duration::from_secs(365 * 24 * 60 * 60))
        .map_err(|_| ServerError::config("idle timeout out of range"))?;

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(Duration::from_secs(10)));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(5000));
    transport.max_concurrent_uni_streams(VarInt::from_u32(5000));
    transport.stream_receive_window(VarInt::from_u32(6 * 1024 * 1024));
    transport.receive_window(VarInt::from_u32(15 * 1024 * 1024));
    transport.send_window(15 * 1024 * 1024);
    transport.datagram_receive_buffer_size(Some(quicgate_proto::MAX_DATAGRAM_SIZE));

    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_is_a_config_error() {
        let err = load_keypair(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn empty_token_rejected() {
        let config = ServerConfig {
            cert: "cert.pem".into(),
            key: "key.pem".into(),
            token: "  ".into(),
            listen: "0.0.0.0:443".parse().unwrap(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn transport_parameters_are_accepted() {
        build_transport().unwrap();
    }
}
