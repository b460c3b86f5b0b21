//! SOCKS5-compatible target addresses
//!
//! The same ATYP encoding appears in three places: the body of a SOCKS5
//! request on the client listener, the header of every SOCKS5 UDP packet,
//! and the reply headers the server builds for returning datagrams. This
//! module is the single codec for all of them.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtoError, Result};

pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// A proxy target: either a literal socket address or a domain plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    SocketAddr(SocketAddr),
    DomainName(String, u16),
}

impl Address {
    #[inline]
    pub fn from_domain(domain: impl Into<String>, port: u16) -> Self {
        Self::DomainName(domain.into(), port)
    }

    #[inline]
    pub fn port(&self) -> u16 {
        match self {
            Self::SocketAddr(addr) => addr.port(),
            Self::DomainName(_, port) => *port,
        }
    }

    /// The host part alone, without port and without brackets for IPv6.
    /// This is the form the routing engine matches against.
    pub fn host(&self) -> String {
        match self {
            Self::SocketAddr(addr) => addr.ip().to_string(),
            Self::DomainName(domain, _) => domain.clone(),
        }
    }

    /// Encoded length of the ATYP + address + port wire form.
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match self {
            Self::SocketAddr(SocketAddr::V4(_)) => 1 + 4 + 2,
            Self::SocketAddr(SocketAddr::V6(_)) => 1 + 16 + 2,
            Self::DomainName(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Append the ATYP wire form to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Self::SocketAddr(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::SocketAddr(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::DomainName(domain, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// Parse the ATYP wire form from a cursor over raw bytes.
    pub fn read_from(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(ProtoError::Truncated);
        }

        match buf.get_u8() {
            ATYP_IPV4 => {
                if buf.remaining() < 6 {
                    return Err(ProtoError::Truncated);
                }
                let mut ip = [0u8; 4];
                buf.copy_to_slice(&mut ip);
                let port = buf.get_u16();
                Ok(Self::SocketAddr(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(ip),
                    port,
                ))))
            }
            ATYP_IPV6 => {
                if buf.remaining() < 18 {
                    return Err(ProtoError::Truncated);
                }
                let mut ip = [0u8; 16];
                buf.copy_to_slice(&mut ip);
                let port = buf.get_u16();
                Ok(Self::SocketAddr(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(ip),
                    port,
                    0,
                    0,
                ))))
            }
            ATYP_DOMAIN => {
                if !buf.has_remaining() {
                    return Err(ProtoError::Truncated);
                }
                let len = buf.get_u8() as usize;
                if len == 0 {
                    return Err(ProtoError::Malformed("empty domain"));
                }
                if buf.remaining() < len + 2 {
                    return Err(ProtoError::Truncated);
                }
                let mut domain = vec![0u8; len];
                buf.copy_to_slice(&mut domain);
                let domain = String::from_utf8(domain)
                    .map_err(|_| ProtoError::Malformed("domain is not UTF-8"))?;
                let port = buf.get_u16();
                Ok(Self::DomainName(domain, port))
            }
            other => Err(ProtoError::UnsupportedAddressType(other)),
        }
    }

    /// Read the address body of a SOCKS5 request (everything after the ATYP
    /// byte, which the caller has already consumed).
    pub async fn read_body<R>(reader: &mut R, atyp: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await?;
                let port = reader.read_u16().await?;
                Ok(Self::SocketAddr(SocketAddr::from((Ipv4Addr::from(ip), port))))
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                reader.read_exact(&mut ip).await?;
                let port = reader.read_u16().await?;
                Ok(Self::SocketAddr(SocketAddr::from((Ipv6Addr::from(ip), port))))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                if len == 0 {
                    return Err(ProtoError::Malformed("empty domain"));
                }
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| ProtoError::Malformed("domain is not UTF-8"))?;
                let port = reader.read_u16().await?;
                Ok(Self::DomainName(domain, port))
            }
            other => Err(ProtoError::UnsupportedAddressType(other)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SocketAddr(addr) => write!(f, "{}", addr),
            Self::DomainName(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    #[inline]
    fn from(addr: SocketAddr) -> Self {
        Self::SocketAddr(addr)
    }
}

impl From<(IpAddr, u16)> for Address {
    #[inline]
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Self::SocketAddr(SocketAddr::new(ip, port))
    }
}

impl From<(&str, u16)> for Address {
    #[inline]
    fn from((domain, port): (&str, u16)) -> Self {
        Self::DomainName(domain.to_string(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: Address) {
        let mut buf = BytesMut::new();
        addr.write_to(&mut buf);
        assert_eq!(buf.len(), addr.serialized_len());
        let parsed = Address::read_from(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn ipv4_roundtrip() {
        roundtrip(Address::from("93.184.216.34:443".parse::<SocketAddr>().unwrap()));
    }

    #[test]
    fn ipv6_roundtrip() {
        roundtrip(Address::from("[2606:2800:220:1::]:80".parse::<SocketAddr>().unwrap()));
    }

    #[test]
    fn domain_roundtrip() {
        roundtrip(Address::from_domain("example.com", 8443));
    }

    #[test]
    fn truncated_ipv4_rejected() {
        let data = [ATYP_IPV4, 127, 0, 0];
        assert!(matches!(
            Address::read_from(&mut Cursor::new(&data[..])),
            Err(ProtoError::Truncated)
        ));
    }

    #[test]
    fn unknown_atyp_rejected() {
        let data = [0x02u8, 0, 0];
        assert!(matches!(
            Address::read_from(&mut Cursor::new(&data[..])),
            Err(ProtoError::UnsupportedAddressType(0x02))
        ));
    }

    #[test]
    fn host_strips_port_and_brackets() {
        let v6 = Address::from("[::1]:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "[::1]:9000");
        let dom = Address::from_domain("www.example.com", 80);
        assert_eq!(dom.host(), "www.example.com");
    }

    #[tokio::test]
    async fn request_body_domain() {
        let mut wire = vec![11u8];
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&443u16.to_be_bytes());
        let mut cursor = std::io::Cursor::new(wire);
        let addr = Address::read_body(&mut cursor, ATYP_DOMAIN).await.unwrap();
        assert_eq!(addr, Address::from_domain("example.com", 443));
    }
}
