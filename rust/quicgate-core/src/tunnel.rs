//! Tunnel supervisor
//!
//! Owns the single QUIC connection to the egress server. Sessions take a
//! cheap clone of the connection handle for the duration of one stream
//! open; only the reconnect path holds the write guard, and it holds it
//! across the dial so concurrent failures collapse into one attempt.

use quinn::{crypto::rustls::QuicClientConfig, Connection, Endpoint, IdleTimeout, VarInt};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, TransportTuning};
use crate::error::{Error, Result};

/// How often the supervisor re-checks connection health.
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(5);

/// Handshake deadline for one dial attempt. The idle timeout is
/// effectively infinite, so an unanswered handshake has to be cut off
/// here or the reconnect critical section would wedge every session
/// waiting on the connection cell.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// QUIC tunnel to the egress server with lazy reconnect.
pub struct Tunnel {
    endpoint: Endpoint,
    quic_config: quinn::ClientConfig,
    server_addr: String,
    server_name: String,
    conn: RwLock<Option<Connection>>,
}

impl Tunnel {
    /// Build the endpoint and TLS/transport configuration. No connection
    /// is dialed yet.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let server_name = config
            .effective_server_name()
            .ok_or_else(|| Error::config("server address has no host part"))?;

        let tls = build_tls_config(config)?;
        let crypto: QuicClientConfig = tls
            .try_into()
            .map_err(|e| Error::config(format!("QUIC TLS config rejected: {}", e)))?;
        let mut quic_config = quinn::ClientConfig::new(Arc::new(crypto));
        quic_config.transport_config(Arc::new(build_transport(&config.transport)?));

        let endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;

        Ok(Self {
            endpoint,
            quic_config,
            server_addr: config.server_addr.clone(),
            server_name,
            conn: RwLock::new(None),
        })
    }

    /// Double-checked acquisition: return the live connection if there is
    /// one, otherwise dial under the write guard.
    pub async fn ensure(&self) -> Result<Connection> {
        {
            let guard = self.conn.read().await;
            if let Some(conn) = guard.as_ref() {
                if conn.close_reason().is_none() {
                    return Ok(conn.clone());
                }
            }
        }

        let mut guard = self.conn.write().await;
        if let Some(conn) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
        }

        let conn = self.dial().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// The current connection, if it is alive. Never dials.
    pub async fn current(&self) -> Option<Connection> {
        let guard = self.conn.read().await;
        guard
            .as_ref()
            .filter(|conn| conn.close_reason().is_none())
            .cloned()
    }

    async fn healthy(&self) -> bool {
        self.current().await.is_some()
    }

    async fn dial(&self) -> Result<Connection> {
        info!("dialing tunnel server {}", self.server_addr);

        let addr = tokio::net::lookup_host(&self.server_addr)
            .await?
            .next()
            .ok_or_else(|| Error::network(format!("{} did not resolve", self.server_addr)))?;

        let connecting =
            self.endpoint
                .connect_with(self.quic_config.clone(), addr, &self.server_name)?;
        let conn = tokio::time::timeout(DIAL_TIMEOUT, connecting)
            .await
            .map_err(|_| Error::Timeout("tunnel dial"))??;

        info!("tunnel established to {}", conn.remote_address());
        Ok(conn)
    }

    /// Spawn the background reconnect task: a 5-second ticker that
    /// re-dials whenever the held connection is absent or dead. Dial
    /// failures are logged and retried on the next tick.
    pub fn spawn_supervisor(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let tunnel = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + SUPERVISOR_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, SUPERVISOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("tunnel supervisor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if tunnel.healthy().await {
                            continue;
                        }
                        if let Err(e) = tunnel.ensure().await {
                            warn!("tunnel reconnect failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Close the connection and the endpoint with application code 0.
    /// Idempotent.
    pub async fn close(&self) {
        let mut guard = self.conn.write().await;
        if let Some(conn) = guard.take() {
            conn.close(VarInt::from_u32(0), b"client shutdown");
        }
        self.endpoint.close(VarInt::from_u32(0), b"client shutdown");
    }
}

fn build_tls_config(config: &ClientConfig) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                roots.add(cert).ok();
            }
        }
        Err(e) => warn!("native trust store unavailable: {}", e),
    }

    if let Some(path) = &config.ca_bundle {
        let pem = std::fs::read(path)
            .map_err(|e| Error::config(format!("CA bundle {}: {}", path.display(), e)))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| Error::config(format!("bad CA bundle entry: {}", e)))?;
            roots.add(cert).ok();
        }
    }

    if roots.is_empty() && !config.skip_cert_verify {
        // Dialing will fail verification later; that is the supervisor's
        // problem to report, not a reason to refuse to start.
        warn!("trust store is empty; tunnel dials will not verify");
    }

    let builder =
        rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);
    let mut tls = if config.skip_cert_verify {
        warn!("certificate verification is DISABLED");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    // The tunnel has to look like ordinary HTTP/3 from the outside.
    tls.alpn_protocols = vec![b"h3".to_vec()];

    Ok(tls)
}

/// Accept any server certificate. Development only.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn build_transport(tuning: &TransportTuning) -> Result<quinn::TransportConfig> {
    let idle = IdleTimeout::try_from(tuning.idle_timeout)
        .map_err(|_| Error::config("idle timeout out of range"))?;

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(tuning.keep_alive_interval));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(tuning.max_concurrent_streams));
    transport.max_concurrent_uni_streams(VarInt::from_u32(tuning.max_concurrent_streams));
    transport.stream_receive_window(VarInt::from_u32(tuning.stream_receive_window));
    transport.receive_window(VarInt::from_u32(tuning.receive_window));
    transport.send_window(tuning.send_window);
    transport.datagram_receive_buffer_size(Some(quicgate_proto::MAX_DATAGRAM_SIZE));

    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn test_config() -> ClientConfig {
        ClientConfig::new("gate.example.net:443", "test-token")
    }

    #[tokio::test]
    async fn new_tunnel_has_no_connection() {
        let tunnel = Tunnel::new(&test_config()).unwrap();
        assert!(tunnel.current().await.is_none());
        assert!(!tunnel.healthy().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let tunnel = Tunnel::new(&test_config()).unwrap();
        tunnel.close().await;
        tunnel.close().await;
        assert!(tunnel.current().await.is_none());
    }

    #[tokio::test]
    async fn supervisor_stops_on_cancel() {
        let tunnel = Arc::new(Tunnel::new(&test_config()).unwrap());
        let cancel = CancellationToken::new();
        let handle = tunnel.spawn_supervisor(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("supervisor did not exit")
            .unwrap();
    }

    #[test]
    fn transport_accepts_default_tuning() {
        build_transport(&TransportTuning::default()).unwrap();
    }
}
