//! VMess server: EAuthID admission, header handshake, TCP and
//! UDP-over-TCP relaying.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;
use uuid::Uuid;

use crate::ProxyError;
use crate::cipher_stream::CipherStream;
use crate::contention::ContentionCache;
use crate::crypto::TAG_LEN;
use crate::dialer::{AsyncStream, Dialer, OutboundCache};
use crate::metadata::{Metadata, MetadataCmd};
use crate::msg::{ControlChannel, MAX_MSG_BODY};
use crate::outbound;
use crate::passage::Passage;
use crate::relay::{DEFAULT_NAT_TIMEOUT, drain, relay_tcp};
use crate::replay::ReplayFilter;
use crate::store::{LocalPassage, PassageStore};
use crate::task::{ChildTask, ShutdownSignal};
use crate::vmess::aead::{AuthIdRejection, cmd_key, open_auth_id};
use crate::vmess::codec::{CMD_TCP, CMD_UDP, RequestHeader, VmessCodec, open_request_instruction, open_request_len};

/// A passage with its VMess command key derived up front.
pub struct VmessPassage {
    passage: Passage,
    hash: String,
    uuid: Uuid,
    cmd_key: [u8; 16],
}

impl VmessPassage {
    pub fn cmd_key(&self) -> &[u8; 16] {
        &self.cmd_key
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }
}

impl LocalPassage for VmessPassage {
    fn localize(mut passage: Passage) -> anyhow::Result<Self> {
        if passage.manager {
            passage.inbound.password = Uuid::new_v4().to_string();
        }
        let uuid: Uuid = passage.inbound.password.parse().unwrap_or_else(|_| {
            warn!(password = %passage.inbound.password, "passage password is not a uuid, generating one");
            Uuid::new_v4()
        });
        let cmd_key = cmd_key(&uuid);
        let hash = passage.argument_hash();
        Ok(VmessPassage {
            passage,
            hash,
            uuid,
            cmd_key,
        })
    }

    fn passage(&self) -> &Passage {
        &self.passage
    }

    fn argument_hash(&self) -> &str {
        &self.hash
    }
}

pub struct VmessServer {
    store: Arc<PassageStore<VmessPassage>>,
    contention: ContentionCache,
    replay: Arc<ReplayFilter>,
    dialer: Dialer,
    outbounds: Arc<OutboundCache>,
    control: ControlChannel,
    max_drain: Option<u64>,
    /// EAuthIDs stamped before this moment are replays from a prior run.
    start_timestamp: i64,
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs() as i64
}

impl VmessServer {
    pub fn new(
        store: Arc<PassageStore<VmessPassage>>,
        replay: Arc<ReplayFilter>,
        dialer: Dialer,
        control: ControlChannel,
        max_drain: Option<u64>,
    ) -> Self {
        VmessServer {
            store,
            contention: ContentionCache::new(),
            replay,
            dialer,
            outbounds: Arc::new(OutboundCache::new()),
            control,
            max_drain,
            start_timestamp: unix_now(),
        }
    }

    pub fn store(&self) -> &Arc<PassageStore<VmessPassage>> {
        &self.store
    }

    pub async fn run_tcp(self: Arc<Self>, listener: TcpListener, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.wait() => return Ok(()),
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
            };
            let server = Arc::clone(&self);
            ChildTask::spawn(async move {
                server.serve_conn(stream, peer).await;
            })
            .detach();
        }
    }

    /// Handle one connection, logging the outcome at a level proportionate
    /// to its hostility. Shared by the TCP listener and the gRPC transport.
    pub async fn serve_conn<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncStream,
    {
        if let Err(error) = self.handle_conn(stream, peer).await {
            match error.downcast_ref::<ProxyError>() {
                Some(e) if e.is_hostile() => warn!(%peer, "connection rejected: {error:#}"),
                Some(e) if e.is_quiet() => debug!(%peer, "connection closed: {error:#}"),
                _ => info!(%peer, "connection failed: {error:#}"),
            }
        }
    }

    /// Probe the auth ID against every passage; checksum mismatch means
    /// "not this key", a window violation or filter hit ends the attempt.
    fn admit(&self, eauth: &[u8; 16]) -> Result<Arc<VmessPassage>, ProxyError> {
        let now = unix_now();
        for candidate in self.store.snapshot() {
            match open_auth_id(&candidate.cmd_key, eauth, now, self.start_timestamp) {
                Ok(()) => {
                    if !self.replay.insert(eauth) {
                        return Err(ProxyError::ReplayAttack);
                    }
                    return Ok(candidate);
                }
                Err(AuthIdRejection::Expired) => return Err(ProxyError::FailAuth),
                Err(AuthIdRejection::NotMatching) => continue,
            }
        }
        Err(ProxyError::FailAuth)
    }

    pub async fn handle_conn<S>(&self, mut stream: S, peer: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncStream,
    {
        let mut eauth = [0u8; 16];
        stream.read_exact(&mut eauth).await.context("read auth id")?;

        let passage = match self.admit(&eauth) {
            Ok(passage) => passage,
            Err(error) => {
                info!(%peer, "auth fail, draining the connection");
                let _ = drain(&mut stream, self.max_drain).await;
                return Err(error.into());
            }
        };

        let cooling = passage.passage().use_class().cooling();
        if let Err(conflict) = self.contention.check(passage.argument_hash(), cooling, peer.ip()) {
            return Err(ProxyError::Contention {
                this: peer.ip(),
                conflict,
            }
            .into());
        }

        // `[len][tag][connection nonce]`, then the instruction.
        let mut envelope = [0u8; 2 + TAG_LEN + 8];
        stream.read_exact(&mut envelope).await.context("read header envelope")?;
        let nonce: [u8; 8] = envelope[2 + TAG_LEN..].try_into().expect("sized above");
        let len = open_request_len(&passage.cmd_key, &eauth, &nonce, &envelope[..2 + TAG_LEN])
            .ok_or(ProxyError::FailAuth)?;

        let mut sealed_instruction = vec![0u8; usize::from(len) + TAG_LEN];
        stream
            .read_exact(&mut sealed_instruction)
            .await
            .context("read instruction")?;
        let instruction = open_request_instruction(&passage.cmd_key, &eauth, &nonce, &sealed_instruction)
            .ok_or(ProxyError::FailAuth)?;
        let header = RequestHeader::decode_instruction(&instruction)?;

        let mut stream = CipherStream::new(stream, VmessCodec::server(&header));

        if let Metadata::Msg { cmd, .. } = header.target {
            return self.handle_msg(&mut stream, cmd, passage.passage()).await;
        }
        if passage.passage().manager {
            return Err(ProxyError::PassageAbuse("manager key used for a non-command connection").into());
        }

        match header.cmd {
            CMD_TCP => match &passage.passage().out {
                None => {
                    let (host, port) = header.target.dial_address();
                    let upstream = self.dialer.dial_tcp(&host, port).await?;
                    relay_tcp(stream, upstream).await?;
                }
                Some(out) => {
                    let next = outbound::select(out, &self.dialer, &self.outbounds)?;
                    let upstream = next.dial(&header.target).await?;
                    relay_tcp(stream, upstream).await?;
                }
            },
            CMD_UDP => {
                let (host, port) = header.target.dial_address();
                let target = self.dialer.resolve_udp(&host, port).await?;
                let socket = self.dialer.bind_udp(&target).await?;
                relay_uot(stream, socket, target).await?;
            }
            other => return Err(anyhow::anyhow!("unexpected instruction cmd: {other}")),
        }
        Ok(())
    }

    async fn handle_msg<S>(&self, stream: &mut S, cmd: MetadataCmd, passage: &Passage) -> anyhow::Result<()>
    where
        S: AsyncStream,
    {
        if !passage.manager {
            return Err(ProxyError::PassageAbuse("control message over a non-manager passage").into());
        }
        let len_body = stream.read_u32().await.context("read message body length")?;
        if len_body > MAX_MSG_BODY {
            return Err(ProxyError::InvalidMetadata.into());
        }
        trace!(?cmd, len_body, "control message");

        let mut body = vec![0u8; len_body as usize];
        stream.read_exact(&mut body).await.context("read message body")?;

        let response = self.control.dispatch(cmd, &body)?;
        stream.write_u32(response.len() as u32).await?;
        stream.write_all(&response).await.context("write message response")?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// UDP-over-TCP: every body chunk is one datagram toward the fixed target;
/// reverse packets come back as chunks.
async fn relay_uot<S>(stream: S, socket: UdpSocket, target: SocketAddr) -> anyhow::Result<()>
where
    S: AsyncStream,
{
    let socket = Arc::new(socket);
    let (mut rd, mut wr) = tokio::io::split(stream);

    let uplink_socket = Arc::clone(&socket);
    let uplink = async move {
        let mut buf = crate::pool::get(65_535);
        loop {
            let n = rd.read(&mut buf).await?;
            if n == 0 {
                return anyhow::Ok(());
            }
            uplink_socket.send_to(&buf[..n], target).await?;
        }
    };

    let downlink = async move {
        let mut buf = crate::pool::get(65_535);
        loop {
            let Ok(received) = timeout(DEFAULT_NAT_TIMEOUT, socket.recv_from(&mut buf)).await else {
                let _ = wr.shutdown().await;
                return anyhow::Ok(());
            };
            let (n, _) = received?;
            wr.write_all(&buf[..n]).await?;
            wr.flush().await?;
        }
    };

    let (up, down) = tokio::join!(uplink, downlink);
    up?;
    down?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::passage::InboundArg;

    use super::*;

    fn passage(uuid: &str) -> Passage {
        Passage {
            manager: false,
            inbound: InboundArg {
                protocol: "vmess".to_owned(),
                password: uuid.to_owned(),
                ..Default::default()
            },
            out: None,
        }
    }

    #[test]
    fn localize_derives_cmd_key_from_uuid() {
        let a = VmessPassage::localize(passage("28446de9-2a7e-4fab-827b-6df93e46f945")).expect("localize");
        let b = VmessPassage::localize(passage("28446de9-2a7e-4fab-827b-6df93e46f945")).expect("localize");
        assert_eq!(a.cmd_key(), b.cmd_key());
    }

    #[test]
    fn localize_regenerates_manager_uuid() {
        let manager = Passage {
            manager: true,
            ..Default::default()
        };
        let a = VmessPassage::localize(manager.clone()).expect("localize");
        let b = VmessPassage::localize(manager).expect("localize");
        assert_ne!(a.uuid(), b.uuid());
        assert!(a.passage().inbound.password.parse::<Uuid>().is_ok());
    }
}
