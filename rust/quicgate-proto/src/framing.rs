//! Per-stream authentication and destination framing
//!
//! Every proxied stream starts with a newline-terminated bearer token,
//! answered by a single status byte, followed by a length-prefixed
//! `host:port` destination, answered by a second status byte. After two
//! `STATUS_OK` bytes the stream is an opaque pipe.
//!
//! The helpers are generic over the tokio IO traits so the same code runs
//! over quinn stream halves in production and `tokio::io::duplex` in tests.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, Result};
use crate::{MAX_ADDR_LEN, MAX_TOKEN_LINE};

/// Write the token line (`token` followed by `\n`).
pub async fn write_token<W>(writer: &mut W, token: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(token.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Read a newline-terminated token line, byte by byte, capped at
/// `MAX_TOKEN_LINE`. Returns the line with surrounding whitespace trimmed.
pub async fn read_token_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() >= MAX_TOKEN_LINE {
            return Err(ProtoError::Malformed("token line too long"));
        }
    }
    let line = String::from_utf8(line).map_err(|_| ProtoError::Malformed("token is not UTF-8"))?;
    Ok(line.trim().to_string())
}

/// Write the destination frame: one length byte followed by the
/// `host:port` string. Destinations over `MAX_ADDR_LEN` bytes are rejected
/// before anything hits the wire.
pub async fn write_destination<W>(writer: &mut W, destination: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = destination.as_bytes();
    if bytes.is_empty() {
        return Err(ProtoError::Malformed("empty destination"));
    }
    if bytes.len() > MAX_ADDR_LEN {
        return Err(ProtoError::AddressTooLong(bytes.len()));
    }
    writer.write_u8(bytes.len() as u8).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

/// Read the destination frame. A zero length byte is malformed.
pub async fn read_destination<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u8().await? as usize;
    if len == 0 {
        return Err(ProtoError::Malformed("zero-length destination"));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProtoError::Malformed("destination is not UTF-8"))
}

/// Write a single status byte.
pub async fn write_status<W>(writer: &mut W, status: u8) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(status).await?;
    Ok(())
}

/// Read a single status byte.
pub async fn read_status<R>(reader: &mut R) -> Result<u8>
where
    R: AsyncRead + Unpin,
{
    Ok(reader.read_u8().await?)
}
