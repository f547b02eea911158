//! Outbound dialing discipline.
//!
//! The default dialer refuses to touch private address space, both for
//! direct targets and for targets reached through DNS answers (rebinding
//! gate). Outbound protocol dialers that need an expensive setup are cached
//! for a while, keyed on the full header fingerprint.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RData;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::time::Instant;

use crate::ProxyError;
use crate::metadata::Metadata;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_IDLE_TTL: Duration = Duration::from_secs(10 * 60);

// RFC 1918, CGNAT, loopback, link-local, multicast, ULA, documentation and
// the rest of the never-route-there table.
const PRIVATE_CIDRS: &[&str] = &[
    "0.0.0.0/32",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "::/128",
    "::1/128",
    "64:ff9b:1::/48",
    "100::/64",
    "2001::/32",
    "2001:20::/28",
    "2001:db8::/32",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

fn private_nets() -> &'static [IpNetwork] {
    static NETS: OnceLock<Vec<IpNetwork>> = OnceLock::new();
    NETS.get_or_init(|| {
        PRIVATE_CIDRS
            .iter()
            .map(|cidr| cidr.parse().expect("static CIDR table is well-formed"))
            .collect()
    })
}

pub fn is_private(ip: IpAddr) -> bool {
    private_nets().iter().any(|net| net.contains(ip))
}

/// Byte stream produced by any outbound leg.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Process-wide direct dialer.
#[derive(Debug, Clone)]
pub struct Dialer {
    pub full_cone: bool,
    /// Test hook: loopback upstreams are legitimate inside the test suite.
    allow_private: bool,
}

impl Dialer {
    pub fn new(full_cone: bool) -> Self {
        Dialer {
            full_cone,
            allow_private: false,
        }
    }

    pub fn permissive() -> Self {
        Dialer {
            full_cone: true,
            allow_private: true,
        }
    }

    async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
        let mut last_private = None;
        for addr in lookup_host((host, port))
            .await
            .with_context(|| format!("resolve {host}"))?
        {
            if !self.allow_private && is_private(addr.ip()) {
                last_private = Some(addr.ip());
                continue;
            }
            return Ok(addr);
        }
        match last_private {
            Some(ip) => Err(ProxyError::DialPrivateAddress(ip).into()),
            None => anyhow::bail!("host lookup for {host} yielded no result"),
        }
    }

    pub async fn dial_tcp(&self, host: &str, port: u16) -> anyhow::Result<TcpStream> {
        let addr = self.resolve(host, port).await?;
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::Timeout)?
            .with_context(|| format!("connect {addr}"))?;
        Ok(stream)
    }

    /// Allocate the per-client outbound packet socket. Full-cone mode keeps
    /// the socket unconnected so any remote may answer.
    pub async fn bind_udp(&self, target: &SocketAddr) -> anyhow::Result<UdpSocket> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal")
        } else {
            "[::]:0".parse().expect("literal")
        };
        let socket = UdpSocket::bind(bind_addr).await.context("bind UDP socket")?;
        if !self.full_cone {
            socket.connect(target).await.context("connect UDP socket")?;
        }
        Ok(socket)
    }

    pub async fn resolve_udp(&self, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
        self.resolve(host, port).await
    }

    pub fn check_target(&self, ip: IpAddr) -> Result<(), ProxyError> {
        if !self.allow_private && is_private(ip) {
            return Err(ProxyError::DialPrivateAddress(ip));
        }
        Ok(())
    }
}

/// DNS rebinding gate: when a response carries an A/AAAA record pointing at
/// private space, the whole answer is replaced by a SERVFAIL before it can
/// reach the client.
pub fn sanitize_dns_response(payload: &[u8]) -> Option<Vec<u8>> {
    let message = Message::from_vec(payload).ok()?;
    let poisoned = message.answers().iter().any(|record| {
        let ip = match record.data() {
            Some(RData::A(a)) => IpAddr::V4(a.0),
            Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
            _ => return false,
        };
        is_private(ip)
    });
    if !poisoned {
        return None;
    }
    let mut refusal = Message::new();
    refusal.set_id(message.id());
    refusal.set_message_type(MessageType::Response);
    refusal.set_op_code(message.op_code());
    refusal.set_response_code(ResponseCode::ServFail);
    for query in message.queries() {
        refusal.add_query(query.clone());
    }
    refusal.to_vec().ok()
}

/// A fully set-up outbound protocol leg (the node acting as a client).
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Open a stream that will deliver bytes to `target` on the far side.
    async fn dial(&self, target: &Metadata) -> anyhow::Result<BoxedStream>;
}

/// Cache of constructed outbound dialers, keyed on the header fingerprint,
/// to amortise TLS/QUIC handshake cost. Entries idle for ten minutes are
/// dropped.
pub struct OutboundCache {
    entries: Mutex<HashMap<String, (Arc<dyn Outbound>, Instant)>>,
}

impl OutboundCache {
    pub fn new() -> Self {
        OutboundCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<dyn Outbound>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, (_, last_used)| now.duration_since(*last_used) < CACHE_IDLE_TTL);
        entries.get_mut(fingerprint).map(|(outbound, last_used)| {
            *last_used = now;
            Arc::clone(outbound)
        })
    }

    pub fn insert(&self, fingerprint: String, outbound: Arc<dyn Outbound>) {
        self.entries.lock().insert(fingerprint, (outbound, Instant::now()));
    }
}

impl Default for OutboundCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable identity of an outbound leg, used as the cache key.
pub fn header_fingerprint(arg: &crate::passage::OutboundArg) -> String {
    format!(
        "{}://{}:{}@{}:{}?method={}",
        arg.protocol, arg.username, arg.password, arg.host, arg.port, arg.method
    )
}
