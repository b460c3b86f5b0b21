use thiserror::Error;

/// Client-side error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] quicgate_proto::ProtoError),

    #[error("QUIC connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("QUIC connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("QUIC write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("tunnel is not connected")]
    TunnelDown,

    #[error("stream authentication rejected by server")]
    AuthRejected,

    #[error("remote dial failed for {0}")]
    RemoteDial(String),

    #[error("timed out: {0}")]
    Timeout(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network(message.into())
    }

    /// Transient errors leave the session or supervisor loop running;
    /// everything else unwinds the owning task.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }
}
