//! End-to-end Shadowsocks scenarios: a scripted client drives the server
//! handler over an in-process pipe, with a real loopback echo upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio::time::timeout;

use ferryman::ProxyError;
use ferryman::bandwidth::BandwidthLimitConf;
use ferryman::cipher_stream::{ChunkCodec as _, CipherStream};
use ferryman::crypto::{CipherKind, evp_bytes_to_key};
use ferryman::dialer::Dialer;
use ferryman::metadata::{Metadata, MetadataCmd, read_metadata};
use ferryman::msg::{ControlChannel, Liveness, PassageSync};
use ferryman::passage::{InboundArg, Passage};
use ferryman::replay::{BloomGroup, FsyncMode};
use ferryman::ss::{SsCodec, SsPassage, SsServer};
use ferryman::store::PassageStore;

const TEST_PASSWORD: &str = "oKLW52IDIZKQ3QXHS434N";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn user_passage() -> Passage {
    Passage {
        manager: false,
        inbound: InboundArg {
            protocol: "shadowsocks".to_owned(),
            method: "aes-128-gcm".to_owned(),
            password: TEST_PASSWORD.to_owned(),
            ..Default::default()
        },
        out: None,
    }
}

struct Harness {
    server: Arc<SsServer>,
    store: Arc<PassageStore<SsPassage>>,
    _bloom_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let bloom_dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(PassageStore::new());
    store
        .add_passages(vec![Passage {
            manager: true,
            ..Default::default()
        }])
        .expect("seed manager");
    store.add_passages(vec![user_passage()]).expect("seed user");
    let bloom = Arc::new(BloomGroup::open(bloom_dir.path(), FsyncMode::Never).expect("bloom"));
    let control = ControlChannel::new(
        Liveness::new(),
        BandwidthLimitConf::default(),
        Arc::clone(&store) as Arc<dyn PassageSync>,
    );
    let server = Arc::new(SsServer::new(
        Arc::clone(&store),
        bloom,
        Dialer::permissive(),
        control,
        Some(1 << 20),
    ));
    Harness {
        server,
        store,
        _bloom_dir: bloom_dir,
    }
}

async fn echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

fn peer(ip: &str) -> SocketAddr {
    format!("{ip}:40000").parse().expect("test address")
}

#[tokio::test]
async fn ss_tcp_round_trip() {
    // S1: authenticated tunnel to an echo target carries bytes both ways.
    let harness = harness();
    let echo = echo_upstream().await;

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = Arc::clone(&harness.server);
    let handler = tokio::spawn(async move { server.handle_tcp(server_io, peer("127.0.0.1")).await });

    let kind = CipherKind::Aes128Gcm;
    let master = evp_bytes_to_key(TEST_PASSWORD, kind.key_len());
    let mut client = CipherStream::new(client_io, SsCodec::client(kind, master));

    client
        .write_all(&Metadata::target(&echo.ip().to_string(), echo.port()).encode())
        .await
        .expect("write target");
    client.write_all(b"ping").await.expect("write payload");
    client.flush().await.expect("flush");

    let mut reply = [0u8; 4];
    timeout(IO_TIMEOUT, client.read_exact(&mut reply))
        .await
        .expect("no timeout")
        .expect("read echo");
    assert_eq!(&reply, b"ping");

    client.shutdown().await.expect("shutdown");
    drop(client);
    handler.await.expect("join").expect("relay completes");
}

#[tokio::test]
async fn ss_handshake_replay_is_rejected() {
    // S3: the exact same first window on a fresh connection dies with
    // ReplayAttack.
    let harness = harness();
    let echo = echo_upstream().await;

    // Forge one full client opening: salt + target + payload.
    let kind = CipherKind::Aes128Gcm;
    let master = evp_bytes_to_key(TEST_PASSWORD, kind.key_len());
    let mut codec = SsCodec::client(kind, master);
    let mut opening = codec.write_prefix().expect("salt");
    let mut first_chunk = Metadata::target(&echo.ip().to_string(), echo.port()).encode();
    first_chunk.extend_from_slice(b"ping");
    opening.extend_from_slice(&codec.seal_chunk(&first_chunk));

    let run = |bytes: Vec<u8>| {
        let server = Arc::clone(&harness.server);
        async move {
            let (mut client_io, server_io) = tokio::io::duplex(1 << 16);
            let handler = tokio::spawn(async move { server.handle_tcp(server_io, peer("127.0.0.1")).await });
            client_io.write_all(&bytes).await.expect("write opening");
            client_io.shutdown().await.expect("shutdown");
            // Drain whatever the server echoes before it closes.
            let mut sink = Vec::new();
            let _ = timeout(IO_TIMEOUT, client_io.read_to_end(&mut sink)).await;
            handler.await.expect("join")
        }
    };

    run(opening.clone()).await.expect("first use passes");
    let error = run(opening).await.expect_err("replay must fail");
    assert!(matches!(
        error.downcast_ref::<ProxyError>(),
        Some(ProxyError::ReplayAttack)
    ));
}

#[tokio::test]
async fn ss_random_prefix_fails_auth() {
    let harness = harness();
    let (mut client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = Arc::clone(&harness.server);
    let handler = tokio::spawn(async move { server.handle_tcp(server_io, peer("127.0.0.1")).await });

    let mut garbage = vec![0u8; 256];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut garbage);
    client_io.write_all(&garbage).await.expect("write garbage");
    client_io.shutdown().await.expect("shutdown");

    let error = handler.await.expect("join").expect_err("must fail auth");
    assert!(matches!(
        error.downcast_ref::<ProxyError>(),
        Some(ProxyError::FailAuth)
    ));
}

async fn manager_client(harness: &Harness) -> (CipherStream<tokio::io::DuplexStream, SsCodec>, tokio::task::JoinHandle<anyhow::Result<()>>, Passage) {
    let manager = harness.store.manager_passage().expect("manager seeded");
    let kind = CipherKind::from_method(&manager.inbound.method).expect("manager method");
    let master = evp_bytes_to_key(&manager.inbound.password, kind.key_len());

    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = Arc::clone(&harness.server);
    let handler = tokio::spawn(async move { server.handle_tcp(server_io, peer("10.0.0.1")).await });
    (CipherStream::new(client_io, SsCodec::client(kind, master)), handler, manager)
}

#[tokio::test]
async fn manager_ping_returns_bandwidth_report() {
    let harness = harness();
    let (mut client, handler, _) = manager_client(&harness).await;

    let mut request = Metadata::Msg {
        cmd: MetadataCmd::Ping,
        len_body: 4,
    }
    .encode();
    request.extend_from_slice(b"ping");
    client.write_all(&request).await.expect("write ping");
    client.flush().await.expect("flush");

    let reply = timeout(IO_TIMEOUT, read_metadata(&mut client))
        .await
        .expect("no timeout")
        .expect("reply metadata");
    let Metadata::Msg { cmd, len_body } = reply else {
        panic!("unexpected reply metadata: {reply:?}");
    };
    assert_eq!(cmd, MetadataCmd::Response);
    let mut body = vec![0u8; len_body as usize];
    client.read_exact(&mut body).await.expect("read body");
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json body");
    assert!(parsed.get("bandwidthLimit").is_some());

    handler.await.expect("join").expect("msg turn completes");
}

#[tokio::test]
async fn control_channel_refused_for_non_manager() {
    let harness = harness();
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = Arc::clone(&harness.server);
    let handler = tokio::spawn(async move { server.handle_tcp(server_io, peer("127.0.0.1")).await });

    let kind = CipherKind::Aes128Gcm;
    let master = evp_bytes_to_key(TEST_PASSWORD, kind.key_len());
    let mut client = CipherStream::new(client_io, SsCodec::client(kind, master));
    let mut request = Metadata::Msg {
        cmd: MetadataCmd::Ping,
        len_body: 4,
    }
    .encode();
    request.extend_from_slice(b"ping");
    client.write_all(&request).await.expect("write ping");
    client.flush().await.expect("flush");

    let error = handler.await.expect("join").expect_err("must be refused");
    assert!(matches!(
        error.downcast_ref::<ProxyError>(),
        Some(ProxyError::PassageAbuse(_))
    ));
}

#[tokio::test]
async fn manager_contention_across_ips() {
    // S4: the same manager credential from a second IP inside the cooling
    // window is refused.
    let harness = harness();
    let (mut client, handler, manager) = manager_client(&harness).await;

    let mut request = Metadata::Msg {
        cmd: MetadataCmd::Ping,
        len_body: 4,
    }
    .encode();
    request.extend_from_slice(b"ping");
    client.write_all(&request).await.expect("write ping");
    client.flush().await.expect("flush");
    let _ = timeout(IO_TIMEOUT, read_metadata(&mut client)).await.expect("no timeout");
    handler.await.expect("join").expect("first ping accepted");

    // Same credential, different IP.
    let kind = CipherKind::from_method(&manager.inbound.method).expect("manager method");
    let master = evp_bytes_to_key(&manager.inbound.password, kind.key_len());
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = Arc::clone(&harness.server);
    let handler = tokio::spawn(async move { server.handle_tcp(server_io, peer("10.0.0.2")).await });
    let mut second = CipherStream::new(client_io, SsCodec::client(kind, master));
    let mut request = Metadata::Msg {
        cmd: MetadataCmd::Ping,
        len_body: 4,
    }
    .encode();
    request.extend_from_slice(b"ping");
    second.write_all(&request).await.expect("write ping");
    second.flush().await.expect("flush");

    let error = handler.await.expect("join").expect_err("contention expected");
    assert!(matches!(
        error.downcast_ref::<ProxyError>(),
        Some(ProxyError::Contention { .. })
    ));
}
