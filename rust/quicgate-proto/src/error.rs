use thiserror::Error;

/// Wire-layer error types
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("fragmented UDP packets are not supported")]
    Fragmented,

    #[error("address too long: {0} bytes")]
    AddressTooLong(usize),

    #[error("truncated packet")]
    Truncated,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProtoError>;
