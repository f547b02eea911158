//! Juicity server: QUIC endpoint, authenticate stream and per-stream relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use quinn::crypto::rustls::QuicServerConfig;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::time::timeout;
use uuid::Uuid;

use crate::ProxyError;
use crate::contention::ContentionCache;
use crate::dialer::{AsyncStream, Dialer, OutboundCache};
use crate::metadata::{Metadata, MetadataCmd};
use crate::msg::{ControlChannel, MAX_MSG_BODY};
use crate::outbound;
use crate::passage::{Passage, generate_secret};
use crate::relay::{DEFAULT_NAT_TIMEOUT, relay_tcp};
use crate::store::{LocalPassage, PassageStore};
use crate::task::{ChildTask, ShutdownSignal};
use crate::tls::CertifiedIdentity;

use super::proto::{Authenticate, EXPORTER_LABEL, STREAM_CMD_CONNECT, STREAM_CMD_PACKET, StreamHeader, TOKEN_LEN,
                   read_datagram, write_datagram};

pub const MANAGER_UUID: Uuid = Uuid::nil();
const MANAGER_PASSWORD_LEN: usize = 23;
const AUTHENTICATE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_INCOMING_STREAMS: u32 = 100;

/// A passage keyed by its Juicity UUID (the `username` field).
pub struct JuicityPassage {
    passage: Passage,
    hash: String,
    uuid: Uuid,
}

impl JuicityPassage {
    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }
}

impl LocalPassage for JuicityPassage {
    fn localize(mut passage: Passage) -> anyhow::Result<Self> {
        if passage.manager {
            passage.inbound.username = MANAGER_UUID.to_string();
            passage.inbound.password = generate_secret(MANAGER_PASSWORD_LEN);
        }
        let uuid: Uuid = passage
            .inbound
            .username
            .parse()
            .with_context(|| format!("passage username {:?} is not a uuid", passage.inbound.username))?;
        let hash = passage.argument_hash();
        Ok(JuicityPassage { passage, hash, uuid })
    }

    fn passage(&self) -> &Passage {
        &self.passage
    }

    fn argument_hash(&self) -> &str {
        &self.hash
    }
}

pub struct JuicityServer {
    store: Arc<PassageStore<JuicityPassage>>,
    contention: ContentionCache,
    dialer: Dialer,
    outbounds: Arc<OutboundCache>,
    control: ControlChannel,
    identity: CertifiedIdentity,
    congestion: String,
}

impl JuicityServer {
    pub fn new(
        store: Arc<PassageStore<JuicityPassage>>,
        dialer: Dialer,
        control: ControlChannel,
        identity: CertifiedIdentity,
        congestion: String,
    ) -> Self {
        JuicityServer {
            store,
            contention: ContentionCache::new(),
            dialer,
            outbounds: Arc::new(OutboundCache::new()),
            control,
            identity,
            congestion,
        }
    }

    pub fn store(&self) -> &Arc<PassageStore<JuicityPassage>> {
        &self.store
    }

    fn server_config(&self) -> anyhow::Result<quinn::ServerConfig> {
        let mut crypto = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(self.identity.chain(), self.identity.key())
            .context("load certificate")?;
        crypto.alpn_protocols = vec![b"h3".to_vec()];

        let mut config =
            quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(crypto).context("quic tls")?));
        let mut transport = quinn::TransportConfig::default();
        transport.max_concurrent_bidi_streams(MAX_INCOMING_STREAMS.into());
        transport.max_concurrent_uni_streams(MAX_INCOMING_STREAMS.into());
        transport.keep_alive_interval(Some(Duration::from_secs(10)));
        super::apply_congestion(&mut transport, &self.congestion);
        config.transport_config(Arc::new(transport));
        Ok(config)
    }

    pub async fn run(self: Arc<Self>, bind: SocketAddr, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
        let endpoint = quinn::Endpoint::server(self.server_config()?, bind).context("bind quic endpoint")?;
        info!(addr = %bind, "juicity endpoint started");
        loop {
            let incoming = tokio::select! {
                incoming = endpoint.accept() => incoming,
                _ = shutdown.wait() => {
                    endpoint.close(0u32.into(), b"shutdown");
                    return Ok(());
                }
            };
            let Some(incoming) = incoming else {
                return Ok(());
            };
            let server = Arc::clone(&self);
            ChildTask::spawn(async move {
                match incoming.await {
                    Ok(connection) => server.handle_connection(connection).await,
                    Err(error) => debug!(%error, "quic handshake failed"),
                }
            })
            .detach();
        }
    }

    async fn handle_connection(self: Arc<Self>, connection: quinn::Connection) {
        let peer = connection.remote_address();
        let (auth_tx, auth_rx) = tokio::sync::watch::channel::<Option<Uuid>>(None);

        // The authenticate command arrives on its own unidirectional stream,
        // concurrently with the first data streams.
        let auth_conn = connection.clone();
        let auth_server = Arc::clone(&self);
        let auth_task = ChildTask::spawn(async move {
            match timeout(AUTHENTICATE_TIMEOUT, auth_server.authenticate(&auth_conn)).await {
                Ok(Ok(uuid)) => {
                    let _ = auth_tx.send(Some(uuid));
                }
                Ok(Err(error)) => {
                    warn!(%peer, "authenticate failed: {error:#}");
                    auth_conn.close(1u32.into(), b"authentication failed");
                }
                Err(_) => {
                    warn!(%peer, "authenticate timed out");
                    auth_conn.close(1u32.into(), b"authentication timeout");
                }
            }
        });

        loop {
            let (send, recv) = match connection.accept_bi().await {
                Ok(pair) => pair,
                Err(quinn::ConnectionError::ApplicationClosed(_) | quinn::ConnectionError::LocallyClosed) => break,
                Err(error) => {
                    debug!(%peer, %error, "connection ended");
                    break;
                }
            };
            let server = Arc::clone(&self);
            let auth_rx = auth_rx.clone();
            ChildTask::spawn(async move {
                if let Err(error) = server.handle_stream(send, recv, peer, auth_rx).await {
                    match error.downcast_ref::<ProxyError>() {
                        Some(e) if e.is_hostile() => warn!(%peer, "stream rejected: {error:#}"),
                        Some(e) if e.is_quiet() => debug!(%peer, "stream closed: {error:#}"),
                        _ => info!(%peer, "stream failed: {error:#}"),
                    }
                }
            })
            .detach();
        }
        drop(auth_task);
    }

    async fn authenticate(&self, connection: &quinn::Connection) -> anyhow::Result<Uuid> {
        let mut stream = connection.accept_uni().await.context("accept auth stream")?;
        let auth = Authenticate::read_from(&mut stream).await?;
        let passage = self
            .store
            .find(|p| p.uuid == auth.uuid)
            .ok_or(ProxyError::FailAuth)
            .with_context(|| format!("no such user: {}", auth.uuid))?;
        let expected = exporter_token(connection, &auth.uuid, &passage.passage().inbound.password)?;
        if expected != auth.token {
            return Err(ProxyError::FailAuth.into());
        }
        debug!(uuid = %auth.uuid, "stream authenticated");
        Ok(auth.uuid)
    }

    async fn handle_stream(
        &self,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        peer: SocketAddr,
        mut auth_rx: tokio::sync::watch::Receiver<Option<Uuid>>,
    ) -> anyhow::Result<()> {
        let mut stream = tokio::io::join(recv, send);
        let header = StreamHeader::read_from(&mut stream).await?;

        // Hold data streams until the authenticate stream has settled.
        let uuid = loop {
            if let Some(uuid) = *auth_rx.borrow() {
                break uuid;
            }
            auth_rx.changed().await.context("connection closed before auth")?;
        };
        let passage = self.store.find(|p| p.uuid == uuid).ok_or(ProxyError::FailAuth)?;

        let cooling = passage.passage().use_class().cooling();
        if let Err(conflict) = self.contention.check(passage.argument_hash(), cooling, peer.ip()) {
            return Err(ProxyError::Contention {
                this: peer.ip(),
                conflict,
            }
            .into());
        }

        if let Metadata::Msg { cmd, .. } = header.target {
            return self.handle_msg(&mut stream, cmd, passage.passage()).await;
        }
        if passage.passage().manager {
            return Err(ProxyError::PassageAbuse("manager key used for a non-command connection").into());
        }

        match header.cmd {
            STREAM_CMD_CONNECT => match &passage.passage().out {
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
            STREAM_CMD_PACKET => {
                self.relay_packet_stream(stream).await?;
            }
            other => return Err(anyhow::anyhow!("unexpected stream cmd: {other}")),
        }
        Ok(())
    }

    /// UDP over the stream: framed datagrams out, framed datagrams back.
    async fn relay_packet_stream<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncStream,
    {
        let (mut rd, mut wr) = tokio::io::split(stream);

        let Some((first_target, first_payload)) = read_datagram(&mut rd).await? else {
            return Ok(());
        };
        let (host, port) = first_target.dial_address();
        let target = self.dialer.resolve_udp(&host, port).await?;
        let socket = Arc::new(self.dialer.bind_udp(&target).await?);
        socket.send_to(&first_payload, target).await?;

        let uplink_socket = Arc::clone(&socket);
        let dialer = self.dialer.clone();
        let uplink = async move {
            while let Some((metadata, payload)) = read_datagram(&mut rd).await? {
                let (host, port) = metadata.dial_address();
                let addr = dialer.resolve_udp(&host, port).await?;
                uplink_socket.send_to(&payload, addr).await?;
            }
            anyhow::Ok(())
        };

        let downlink = async move {
            let mut buf = crate::pool::get(65_535);
            loop {
                let Ok(received) = timeout(DEFAULT_NAT_TIMEOUT, socket.recv_from(&mut buf)).await else {
                    let _ = wr.shutdown().await;
                    return anyhow::Ok(());
                };
                let (n, from) = received?;
                let metadata = Metadata::target(&from.ip().to_string(), from.port());
                write_datagram(&mut wr, &metadata, &buf[..n]).await?;
            }
        };

        let (up, down) = tokio::join!(uplink, downlink);
        up?;
        down?;
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
        stream.write_all(&response).await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// TUIC token: TLS exporter keyed by uuid ‖ password.
pub fn exporter_token(
    connection: &quinn::Connection,
    uuid: &Uuid,
    password: &str,
) -> anyhow::Result<[u8; TOKEN_LEN]> {
    let mut context = Vec::with_capacity(16 + password.len());
    context.extend_from_slice(uuid.as_bytes());
    context.extend_from_slice(password.as_bytes());
    let mut token = [0u8; TOKEN_LEN];
    connection
        .export_keying_material(&mut token, EXPORTER_LABEL, &context)
        .map_err(|_| anyhow::anyhow!("tls exporter unavailable"))?;
    Ok(token)
}
