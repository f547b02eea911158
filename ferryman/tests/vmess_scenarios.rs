//! End-to-end VMess scenarios.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio::time::timeout;

use ferryman::ProxyError;
use ferryman::bandwidth::BandwidthLimitConf;
use ferryman::cipher_stream::CipherStream;
use ferryman::dialer::Dialer;
use ferryman::metadata::{Metadata, MetadataCmd};
use ferryman::msg::{ControlChannel, Liveness, PassageSync};
use ferryman::passage::{InboundArg, Passage};
use ferryman::replay::ReplayFilter;
use ferryman::store::PassageStore;
use ferryman::vmess::aead::cmd_key;
use ferryman::vmess::codec::{CMD_TCP, RequestHeader, VmessCodec, VmessSecurity, options};
use ferryman::vmess::{VmessPassage, VmessServer};

const TEST_UUID: &str = "28446de9-2a7e-4fab-827b-6df93e46f945";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn user_passage() -> Passage {
    Passage {
        manager: false,
        inbound: InboundArg {
            protocol: "vmess".to_owned(),
            password: TEST_UUID.to_owned(),
            ..Default::default()
        },
        out: None,
    }
}

struct Harness {
    server: Arc<VmessServer>,
    store: Arc<PassageStore<VmessPassage>>,
}

fn harness() -> Harness {
    let store = Arc::new(PassageStore::new());
    store
        .add_passages(vec![Passage {
            manager: true,
            ..Default::default()
        }])
        .expect("seed manager");
    store.add_passages(vec![user_passage()]).expect("seed user");
    let control = ControlChannel::new(
        Liveness::new(),
        BandwidthLimitConf::default(),
        Arc::clone(&store) as Arc<dyn PassageSync>,
    );
    let server = Arc::new(VmessServer::new(
        Arc::clone(&store),
        Arc::new(ReplayFilter::new(Duration::from_secs(120))),
        Dialer::permissive(),
        control,
        Some(1 << 20),
    ));
    Harness { server, store }
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
    format!("{ip}:41000").parse().expect("test address")
}

fn request_header(target: Metadata, security: VmessSecurity) -> RequestHeader {
    let mut rng = rand::thread_rng();
    let mut body_iv = [0u8; 16];
    let mut body_key = [0u8; 16];
    rng.fill_bytes(&mut body_iv);
    rng.fill_bytes(&mut body_key);
    RequestHeader {
        body_iv,
        body_key,
        resp_auth: 0x42,
        options: options::CHUNK_STREAM | options::CHUNK_MASKING,
        security,
        cmd: CMD_TCP,
        target,
    }
}

#[tokio::test]
async fn vmess_tcp_round_trip() {
    // S2: 8 KiB of random body survives the tunnel to an echo upstream and
    // back, decoded intact.
    let harness = harness();
    let echo = echo_upstream().await;

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = Arc::clone(&harness.server);
    let handler = tokio::spawn(async move { server.handle_conn(server_io, peer("127.0.0.1")).await });

    let key = cmd_key(&TEST_UUID.parse().expect("uuid"));
    let header = request_header(
        Metadata::target(&echo.ip().to_string(), echo.port()),
        VmessSecurity::Aes128Gcm,
    );
    let mut client = CipherStream::new(client_io, VmessCodec::client(&key, &header));

    let mut body = vec![0u8; 8 * 1024];
    rand::thread_rng().fill_bytes(&mut body);
    client.write_all(&body).await.expect("write body");
    client.flush().await.expect("flush");

    let mut reply = vec![0u8; body.len()];
    timeout(IO_TIMEOUT, client.read_exact(&mut reply))
        .await
        .expect("no timeout")
        .expect("read echo");
    assert_eq!(reply, body);

    client.shutdown().await.expect("shutdown");
    drop(client);
    handler.await.expect("join").expect("relay completes");
}

#[tokio::test]
async fn vmess_random_prefix_fails_auth() {
    let harness = harness();
    let (mut client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = Arc::clone(&harness.server);
    let handler = tokio::spawn(async move { server.handle_conn(server_io, peer("127.0.0.1")).await });

    let mut garbage = vec![0u8; 64];
    rand::thread_rng().fill_bytes(&mut garbage);
    client_io.write_all(&garbage).await.expect("write garbage");
    client_io.shutdown().await.expect("shutdown");

    let error = handler.await.expect("join").expect_err("must fail auth");
    assert!(matches!(
        error.downcast_ref::<ProxyError>(),
        Some(ProxyError::FailAuth)
    ));
}

#[tokio::test]
async fn vmess_replayed_auth_id_is_rejected() {
    let harness = harness();
    let echo = echo_upstream().await;
    let key = cmd_key(&TEST_UUID.parse().expect("uuid"));
    let header = request_header(
        Metadata::target(&echo.ip().to_string(), echo.port()),
        VmessSecurity::Aes128Gcm,
    );
    // One sealed request reused verbatim: the EAuthID must only pass once.
    let wire = ferryman::vmess::codec::seal_request(&key, &header);

    let run = |bytes: Vec<u8>| {
        let server = Arc::clone(&harness.server);
        async move {
            let (mut client_io, server_io) = tokio::io::duplex(1 << 16);
            let handler = tokio::spawn(async move { server.handle_conn(server_io, peer("127.0.0.1")).await });
            client_io.write_all(&bytes).await.expect("write");
            client_io.shutdown().await.expect("shutdown");
            let mut sink = Vec::new();
            let _ = timeout(IO_TIMEOUT, client_io.read_to_end(&mut sink)).await;
            handler.await.expect("join")
        }
    };

    // First pass reaches the relay stage (and then sees client EOF).
    let _ = run(wire.clone()).await;
    let error = run(wire).await.expect_err("replay must fail");
    assert!(matches!(
        error.downcast_ref::<ProxyError>(),
        Some(ProxyError::ReplayAttack)
    ));
}

#[tokio::test]
async fn manager_sync_passages_over_vmess() {
    // The controller replaces the passage set through the tunnel; the reply
    // is "OK" and the store reflects the diff.
    let harness = harness();
    let manager = harness.store.manager_passage().expect("manager seeded");
    let key = cmd_key(&manager.inbound.password.parse().expect("manager uuid"));

    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let server = Arc::clone(&harness.server);
    let handler = tokio::spawn(async move { server.handle_conn(server_io, peer("10.0.0.9")).await });

    let header = request_header(
        Metadata::Msg {
            cmd: MetadataCmd::SyncPassages,
            len_body: 0,
        },
        VmessSecurity::Aes128Gcm,
    );
    let mut client = CipherStream::new(client_io, VmessCodec::client(&key, &header));

    let replacement = vec![user_passage()];
    let body = serde_json::to_vec(&replacement).expect("serialize");
    client.write_u32(body.len() as u32).await.expect("write length");
    client.write_all(&body).await.expect("write body");
    client.flush().await.expect("flush");

    let len = timeout(IO_TIMEOUT, client.read_u32())
        .await
        .expect("no timeout")
        .expect("read length");
    let mut reply = vec![0u8; len as usize];
    client.read_exact(&mut reply).await.expect("read body");
    assert_eq!(reply, b"OK");

    handler.await.expect("join").expect("sync completes");

    let passages = harness.store.passages();
    assert_eq!(passages.len(), 2); // manager + the synced user passage
    assert!(passages.iter().any(|p| p.manager));
    assert!(passages.iter().any(|p| p.inbound.password == TEST_UUID));
}
