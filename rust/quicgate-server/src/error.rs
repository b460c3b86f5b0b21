use thiserror::Error;

/// Server-side error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("QUIC connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("protocol error: {0}")]
    Proto(#[from] quicgate_proto::ProtoError),

    #[error("stream credentials rejected")]
    AuthFailed,

    #[error("timed out reading stream credentials")]
    CredentialTimeout,

    #[error("egress dial failed for {0}")]
    Dial(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }
}
