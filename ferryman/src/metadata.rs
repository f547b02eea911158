//! Unified framed address and control-message codec.
//!
//! Every protocol front-end reuses the same 1/3/4 type tags for IPv4, domain
//! and IPv6 targets. The `Msg` type is internal to the node↔controller
//! channel and never reaches an upstream.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt as _};

use crate::ProxyError;

pub const ADDR_TYPE_IPV4: u8 = 1;
pub const ADDR_TYPE_DOMAIN: u8 = 3;
pub const ADDR_TYPE_IPV6: u8 = 4;
pub const ADDR_TYPE_MSG: u8 = 0x80;

/// Control-channel commands carried by `Msg`-typed metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataCmd {
    Ping,
    SyncPassages,
    Response,
}

impl MetadataCmd {
    pub fn to_byte(self) -> u8 {
        match self {
            MetadataCmd::Ping => 0,
            MetadataCmd::SyncPassages => 1,
            MetadataCmd::Response => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MetadataCmd::Ping),
            1 => Some(MetadataCmd::SyncPassages),
            2 => Some(MetadataCmd::Response),
            _ => None,
        }
    }
}

/// A decoded target address or in-band control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    Ipv4 { addr: Ipv4Addr, port: u16 },
    Ipv6 { addr: Ipv6Addr, port: u16 },
    Domain { host: String, port: u16 },
    /// `[cmd:u8][len_body:u32 BE]`; the plaintext body of `len_body` bytes
    /// follows the metadata in the same stream.
    Msg { cmd: MetadataCmd, len_body: u32 },
}

impl Metadata {
    pub fn target(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => Metadata::Ipv4 { addr, port },
            Ok(IpAddr::V6(addr)) => Metadata::Ipv6 { addr, port },
            Err(_) => Metadata::Domain {
                host: host.to_owned(),
                port,
            },
        }
    }

    pub fn is_msg(&self) -> bool {
        matches!(self, Metadata::Msg { .. })
    }

    /// `host:port` form suitable for dialing. Panics on `Msg` — control
    /// metadata never names a dial target.
    pub fn dial_address(&self) -> (String, u16) {
        match self {
            Metadata::Ipv4 { addr, port } => (addr.to_string(), *port),
            Metadata::Ipv6 { addr, port } => (addr.to_string(), *port),
            Metadata::Domain { host, port } => (host.clone(), *port),
            Metadata::Msg { .. } => unreachable!("control metadata has no dial target"),
        }
    }

    /// Wire size of a metadata record starting with `head` (at least 2
    /// bytes). Used to read exactly one record off a stream.
    pub fn wire_size(head: &[u8]) -> Result<usize, ProxyError> {
        if head.len() < 2 {
            return Err(ProxyError::InvalidMetadata);
        }
        match head[0] {
            ADDR_TYPE_IPV4 => Ok(1 + 4 + 2),
            ADDR_TYPE_IPV6 => Ok(1 + 16 + 2),
            ADDR_TYPE_DOMAIN => match head[1] {
                0 => Err(ProxyError::InvalidMetadata),
                len => Ok(1 + 1 + len as usize + 2),
            },
            ADDR_TYPE_MSG => Ok(1 + 1 + 4),
            _ => Err(ProxyError::InvalidMetadata),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProxyError> {
        let size = Self::wire_size(buf)?;
        if buf.len() < size {
            return Err(ProxyError::InvalidMetadata);
        }
        match buf[0] {
            ADDR_TYPE_IPV4 => {
                let octets: [u8; 4] = buf[1..5].try_into().expect("sized above");
                Ok(Metadata::Ipv4 {
                    addr: Ipv4Addr::from(octets),
                    port: u16::from_be_bytes([buf[5], buf[6]]),
                })
            }
            ADDR_TYPE_IPV6 => {
                let octets: [u8; 16] = buf[1..17].try_into().expect("sized above");
                Ok(Metadata::Ipv6 {
                    addr: Ipv6Addr::from(octets),
                    port: u16::from_be_bytes([buf[17], buf[18]]),
                })
            }
            ADDR_TYPE_DOMAIN => {
                let len = buf[1] as usize;
                let host = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| ProxyError::InvalidMetadata)?
                    .to_owned();
                Ok(Metadata::Domain {
                    host,
                    port: u16::from_be_bytes([buf[2 + len], buf[3 + len]]),
                })
            }
            ADDR_TYPE_MSG => {
                let cmd = MetadataCmd::from_byte(buf[1]).ok_or(ProxyError::InvalidMetadata)?;
                let len_body = u32::from_be_bytes(buf[2..6].try_into().expect("sized above"));
                Ok(Metadata::Msg { cmd, len_body })
            }
            _ => Err(ProxyError::InvalidMetadata),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Metadata::Ipv4 { addr, port } => {
                let mut out = Vec::with_capacity(7);
                out.push(ADDR_TYPE_IPV4);
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
                out
            }
            Metadata::Ipv6 { addr, port } => {
                let mut out = Vec::with_capacity(19);
                out.push(ADDR_TYPE_IPV6);
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
                out
            }
            Metadata::Domain { host, port } => {
                debug_assert!(!host.is_empty() && host.len() <= 255);
                let mut out = Vec::with_capacity(4 + host.len());
                out.push(ADDR_TYPE_DOMAIN);
                out.push(host.len() as u8);
                out.extend_from_slice(host.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                out
            }
            Metadata::Msg { cmd, len_body } => {
                let mut out = Vec::with_capacity(6);
                out.push(ADDR_TYPE_MSG);
                out.push(cmd.to_byte());
                out.extend_from_slice(&len_body.to_be_bytes());
                out
            }
        }
    }
}

/// Read exactly one metadata record off a (decrypting) stream.
pub async fn read_metadata<S>(stream: &mut S) -> anyhow::Result<Metadata>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let size = Metadata::wire_size(&head)?;
    let mut buf = vec![0u8; size];
    buf[..2].copy_from_slice(&head);
    stream.read_exact(&mut buf[2..]).await?;
    Ok(Metadata::decode(&buf)?)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn rejects_short_buffer() {
        assert!(matches!(Metadata::wire_size(&[1]), Err(ProxyError::InvalidMetadata)));
        assert!(matches!(Metadata::decode(&[1, 2, 3]), Err(ProxyError::InvalidMetadata)));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(matches!(Metadata::decode(&[9, 0, 0, 0]), Err(ProxyError::InvalidMetadata)));
    }

    #[test]
    fn rejects_empty_domain() {
        assert!(matches!(
            Metadata::decode(&[ADDR_TYPE_DOMAIN, 0, 0, 80]),
            Err(ProxyError::InvalidMetadata)
        ));
    }

    #[test]
    fn msg_round_trip() {
        let msg = Metadata::Msg {
            cmd: MetadataCmd::SyncPassages,
            len_body: 0xDEAD,
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 6);
        assert_eq!(Metadata::wire_size(&encoded).expect("valid"), 6);
        assert_eq!(Metadata::decode(&encoded).expect("valid"), msg);
    }

    proptest! {
        #[test]
        fn ipv4_round_trip(octets: [u8; 4], port: u16) {
            let m = Metadata::Ipv4 { addr: Ipv4Addr::from(octets), port };
            prop_assert_eq!(Metadata::decode(&m.encode()).expect("valid"), m);
        }

        #[test]
        fn ipv6_round_trip(octets: [u8; 16], port: u16) {
            let m = Metadata::Ipv6 { addr: Ipv6Addr::from(octets), port };
            prop_assert_eq!(Metadata::decode(&m.encode()).expect("valid"), m);
        }

        #[test]
        fn domain_round_trip(host in "[a-z0-9.-]{1,255}", port: u16) {
            let m = Metadata::Domain { host, port };
            let encoded = m.encode();
            prop_assert_eq!(Metadata::wire_size(&encoded).expect("valid"), encoded.len());
            prop_assert_eq!(Metadata::decode(&encoded).expect("valid"), m);
        }
    }
}
