//! Shadowsocks server: TCP accept path, credential probing and the control
//! channel dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;

use crate::ProxyError;
use crate::cipher_stream::CipherStream;
use crate::contention::ContentionCache;
use crate::crypto::{CipherKind, TAG_LEN, derive_subkey, evp_bytes_to_key};
use crate::dialer::{Dialer, OutboundCache};
use crate::metadata::{Metadata, MetadataCmd, read_metadata};
use crate::msg::{ControlChannel, MAX_MSG_BODY};
use crate::outbound;
use crate::passage::{Passage, generate_secret};
use crate::relay::{drain, relay_tcp};
use crate::replay::BloomGroup;
use crate::ss::{BASIC_LEN, SsCodec};
use crate::store::{LocalPassage, PassageStore};
use crate::task::{ChildTask, ShutdownSignal};

const MANAGER_METHOD: &str = "aes-256-gcm";

/// A passage with its Shadowsocks key material derived up front.
pub struct SsPassage {
    passage: Passage,
    hash: String,
    kind: CipherKind,
    master_key: Vec<u8>,
}

impl SsPassage {
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }
}

impl LocalPassage for SsPassage {
    fn localize(mut passage: Passage) -> anyhow::Result<Self> {
        if passage.manager {
            passage.inbound.password = generate_secret(21);
            passage.inbound.method = MANAGER_METHOD.to_owned();
        }
        let kind = CipherKind::from_method(&passage.inbound.method)
            .with_context(|| format!("unsupported cipher method {:?}", passage.inbound.method))?;
        let master_key = evp_bytes_to_key(&passage.inbound.password, kind.key_len());
        let hash = passage.argument_hash();
        Ok(SsPassage {
            passage,
            hash,
            kind,
            master_key,
        })
    }

    fn passage(&self) -> &Passage {
        &self.passage
    }

    fn argument_hash(&self) -> &str {
        &self.hash
    }
}

pub struct SsServer {
    store: Arc<PassageStore<SsPassage>>,
    contention: ContentionCache,
    bloom: Arc<BloomGroup>,
    dialer: Dialer,
    outbounds: Arc<OutboundCache>,
    control: ControlChannel,
    max_drain: Option<u64>,
    nat: Arc<super::udp::UdpNatMap>,
}

impl SsServer {
    pub fn new(
        store: Arc<PassageStore<SsPassage>>,
        bloom: Arc<BloomGroup>,
        dialer: Dialer,
        control: ControlChannel,
        max_drain: Option<u64>,
    ) -> Self {
        SsServer {
            store,
            contention: ContentionCache::new(),
            bloom,
            dialer,
            outbounds: Arc::new(OutboundCache::new()),
            control,
            max_drain,
            nat: Arc::new(super::udp::UdpNatMap::default()),
        }
    }

    pub fn store(&self) -> &Arc<PassageStore<SsPassage>> {
        &self.store
    }

    pub(super) fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub(super) fn nat(&self) -> &super::udp::UdpNatMap {
        &self.nat
    }

    pub(super) fn nat_handle(&self) -> Arc<super::udp::UdpNatMap> {
        Arc::clone(&self.nat)
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
                if let Err(error) = server.handle_tcp(stream, peer).await {
                    match error.downcast_ref::<ProxyError>() {
                        Some(e) if e.is_hostile() => warn!(%peer, "connection rejected: {error:#}"),
                        Some(e) if e.is_quiet() => debug!(%peer, "connection closed: {error:#}"),
                        _ => info!(%peer, "connection failed: {error:#}"),
                    }
                }
            })
            .detach();
        }
    }

    /// Probe the first `[salt][len][tag]` window against every candidate
    /// key; the first one whose length block authenticates wins.
    fn probe(head: &[u8], candidate: &SsPassage) -> Option<Vec<u8>> {
        let salt_len = candidate.kind.salt_len();
        let salt = &head[..salt_len];
        let block = &head[salt_len..salt_len + 2 + TAG_LEN];
        let subkey = derive_subkey(&candidate.master_key, salt, candidate.kind.key_len());
        let cipher = candidate.kind.new_cipher(&subkey);
        cipher.open(&[0u8; crate::crypto::NONCE_LEN], block, &[])?;
        Some(subkey)
    }

    pub async fn handle_tcp<S>(&self, mut stream: S, peer: SocketAddr) -> anyhow::Result<()>
    where
        S: crate::dialer::AsyncStream,
    {
        let mut head = [0u8; BASIC_LEN];
        stream.read_exact(&mut head).await.context("read auth window")?;

        let context = self.store.user_context(peer.ip());
        let Some((passage, _subkey)) = context.auth(|p| Self::probe(&head, p)) else {
            info!(%peer, "auth fail, draining the connection");
            let _ = drain(&mut stream, self.max_drain).await;
            return Err(ProxyError::FailAuth.into());
        };

        let salt = &head[..passage.kind.salt_len()];
        if self.bloom.exist_or_add(salt) {
            return Err(ProxyError::ReplayAttack.into());
        }

        let cooling = passage.passage().use_class().cooling();
        if let Err(conflict) = self.contention.check(passage.argument_hash(), cooling, peer.ip()) {
            return Err(ProxyError::Contention {
                this: peer.ip(),
                conflict,
            }
            .into());
        }

        let codec = SsCodec::server(
            passage.kind,
            passage.master_key.clone(),
            salt,
            Arc::clone(&self.bloom),
        );
        let mut stream = CipherStream::new(stream, codec).preread(&head[passage.kind.salt_len()..]);

        let target = read_metadata(&mut stream).await.context("read target metadata")?;

        if let Metadata::Msg { cmd, len_body } = target {
            return self.handle_msg(&mut stream, cmd, len_body, passage.passage()).await;
        }
        if passage.passage().manager {
            return Err(ProxyError::PassageAbuse("manager key used for a non-command connection").into());
        }

        match &passage.passage().out {
            None => {
                let (host, port) = target.dial_address();
                let upstream = self.dialer.dial_tcp(&host, port).await?;
                relay_tcp(stream, upstream).await?;
            }
            Some(out) => {
                let next = outbound::select(out, &self.dialer, &self.outbounds)?;
                let upstream = next.dial(&target).await?;
                relay_tcp(stream, upstream).await?;
            }
        }
        Ok(())
    }

    async fn handle_msg<S>(
        &self,
        stream: &mut S,
        cmd: MetadataCmd,
        len_body: u32,
        passage: &Passage,
    ) -> anyhow::Result<()>
    where
        S: crate::dialer::AsyncStream,
    {
        if !passage.manager {
            return Err(ProxyError::PassageAbuse("control message over a non-manager passage").into());
        }
        if len_body > MAX_MSG_BODY {
            return Err(ProxyError::InvalidMetadata.into());
        }
        trace!(?cmd, len_body, "control message");

        let mut body = vec![0u8; len_body as usize];
        stream.read_exact(&mut body).await.context("read message body")?;

        let response = self.control.dispatch(cmd, &body)?;
        let header = Metadata::Msg {
            cmd: MetadataCmd::Response,
            len_body: response.len() as u32,
        };
        let mut reply = header.encode();
        reply.extend_from_slice(&response);
        stream.write_all(&reply).await.context("write message response")?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::passage::InboundArg;

    use super::*;

    fn passage(method: &str, password: &str) -> Passage {
        Passage {
            manager: false,
            inbound: InboundArg {
                protocol: "shadowsocks".to_owned(),
                method: method.to_owned(),
                password: password.to_owned(),
                ..Default::default()
            },
            out: None,
        }
    }

    #[test]
    fn localize_rejects_unknown_method() {
        assert!(SsPassage::localize(passage("rc4-md5", "x")).is_err());
    }

    #[test]
    fn localize_regenerates_manager_secret() {
        let manager = Passage {
            manager: true,
            ..Default::default()
        };
        let local = SsPassage::localize(manager).expect("manager localizes");
        assert_eq!(local.passage().inbound.method, MANAGER_METHOD);
        assert_eq!(local.passage().inbound.password.len(), 21);
        assert_eq!(local.kind(), CipherKind::Aes256Gcm);
    }

    #[test]
    fn probe_accepts_own_key_and_rejects_random_prefix() {
        let local = SsPassage::localize(passage("aes-128-gcm", "oKLW52IDIZKQ3QXHS434N")).expect("localize");

        // Forge a valid first window with the client-side codec.
        let mut codec = SsCodec::client(local.kind(), local.master_key().to_vec());
        use crate::cipher_stream::ChunkCodec as _;
        let mut wire = codec.write_prefix().expect("salt");
        wire.extend_from_slice(&codec.seal_chunk(b"x"));
        let mut head = [0u8; BASIC_LEN];
        head.copy_from_slice(&wire[..BASIC_LEN]);
        assert!(SsServer::probe(&head, &local).is_some());

        let mut garbage = [0u8; BASIC_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut garbage);
        assert!(SsServer::probe(&garbage, &local).is_none());
    }
}
