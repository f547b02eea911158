//! gun-style gRPC transport: the VMess byte stream rides the payload of a
//! `Tun(stream Hunk)` bidirectional RPC over h2 + TLS.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use anyhow::Context as _;
use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use prost::Message as _;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::PollSender;

use crate::dialer::Dialer;
use crate::replay::fnv1a64;
use crate::task::{ChildTask, ShutdownSignal};
use crate::vmess::VmessServer;

/// How long a TLS handshake may stall before we assume the certificate is
/// stale and nudge the registrar.
const STALE_CERT_THRESHOLD: Duration = Duration::from_secs(5);

const CONTENT_TYPE_GRPC: &str = "application/grpc";

/// The single message of the tunnel service.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Hunk {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

/// Deterministic per-ticket service name: an FNV-64a-seeded xorshift
/// sequence rendered in a gRPC-safe base64 alphabet, 3–12 characters.
pub fn service_name_from_ticket(ticket: &str) -> String {
    const HEAD: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    const TAIL: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_$";

    let mut state = fnv1a64(ticket.as_bytes()) | 1;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let len = 3 + (next() % 10) as usize;
    let mut name = String::with_capacity(len);
    name.push(HEAD[(next() % HEAD.len() as u64) as usize] as char);
    for _ in 1..len {
        name.push(TAIL[(next() % TAIL.len() as u64) as usize] as char);
    }
    name
}

/// `[compressed:u8=0][len:u32 BE][protobuf]`
fn encode_hunk(data: &[u8]) -> Bytes {
    let hunk = Hunk { data: data.to_vec() };
    let body_len = hunk.encoded_len();
    let mut out = BytesMut::with_capacity(5 + body_len);
    out.put_u8(0);
    out.put_u32(body_len as u32);
    hunk.encode(&mut out).expect("capacity reserved");
    out.freeze()
}

/// Incremental decoder for the gRPC message framing.
#[derive(Default)]
struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next(&mut self) -> anyhow::Result<Option<Hunk>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        anyhow::ensure!(self.buf[0] == 0, "compressed grpc frames are not supported");
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < 5 + len {
            return Ok(None);
        }
        self.buf.advance(5);
        let hunk = Hunk::decode(&self.buf[..len]).context("malformed hunk")?;
        self.buf.advance(len);
        Ok(Some(hunk))
    }
}

/// The tunnel payload as a plain byte stream. Reads pull decoded hunk
/// payloads off a channel fed by the h2 pump; writes push into the outgoing
/// pump, one hunk per write.
pub struct GrpcTunStream {
    incoming: mpsc::Receiver<Bytes>,
    outgoing: PollSender<Bytes>,
    leftover: Bytes,
}

impl GrpcTunStream {
    fn new(incoming: mpsc::Receiver<Bytes>, outgoing: mpsc::Sender<Bytes>) -> Self {
        GrpcTunStream {
            incoming,
            outgoing: PollSender::new(outgoing),
            leftover: Bytes::new(),
        }
    }
}

impl AsyncRead for GrpcTunStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.leftover.is_empty() {
            match ready!(this.incoming.poll_recv(cx)) {
                Some(bytes) => this.leftover = bytes,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.leftover.len().min(out.remaining());
        out.put_slice(&this.leftover[..n]);
        this.leftover.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for GrpcTunStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.outgoing.poll_reserve(cx)).map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        this.outgoing
            .send_item(Bytes::copy_from_slice(data))
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().outgoing.close();
        Poll::Ready(Ok(()))
    }
}

/// Accept loop for the `vmess+tls+grpc` listener.
pub struct GrpcTunnel {
    acceptor: TlsAcceptor,
    service_path: String,
    server: Arc<VmessServer>,
    reregister_nudge: Arc<Notify>,
}

impl GrpcTunnel {
    pub fn new(
        acceptor: TlsAcceptor,
        service_name: &str,
        server: Arc<VmessServer>,
        reregister_nudge: Arc<Notify>,
    ) -> Self {
        GrpcTunnel {
            acceptor,
            service_path: format!("/{service_name}/Tun"),
            server,
            reregister_nudge,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
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
            let tunnel = Arc::clone(&self);
            ChildTask::spawn(async move {
                if let Err(error) = tunnel.serve_tls_conn(stream, peer).await {
                    info!(%peer, "grpc transport failed: {error:#}");
                }
            })
            .detach();
        }
    }

    async fn serve_tls_conn(&self, stream: tokio::net::TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let started = tokio::time::Instant::now();
        let tls = self.acceptor.accept(stream).await;
        if started.elapsed() >= STALE_CERT_THRESHOLD {
            // A client hello stalling this long means peers no longer trust
            // our certificate chain; ask the registrar to refresh.
            warn!(%peer, "slow client hello, certificate looks stale");
            self.reregister_nudge.notify_one();
        }
        let tls = tls.context("tls accept")?;

        let mut connection = h2::server::handshake(tls).await.context("h2 handshake")?;
        while let Some(request) = connection.accept().await {
            let (request, mut respond) = request?;
            if request.method() != http::Method::POST || request.uri().path() != self.service_path {
                debug!(%peer, path = %request.uri().path(), "rejecting unknown rpc");
                let not_found = http::Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(())
                    .expect("static response");
                let _ = respond.send_response(not_found, true);
                continue;
            }

            let server = Arc::clone(&self.server);
            ChildTask::spawn(async move {
                if let Err(error) = serve_tun_rpc(request, respond, server, peer).await {
                    info!(%peer, "tun rpc failed: {error:#}");
                }
            })
            .detach();
        }
        Ok(())
    }
}

async fn serve_tun_rpc(
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    server: Arc<VmessServer>,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let response = http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, CONTENT_TYPE_GRPC)
        .body(())
        .expect("static response");
    let send = respond.send_response(response, false).context("send response headers")?;

    let (stream, [inbound, outbound]) = tun_pumps(request.into_body(), send);
    server.serve_conn(stream, peer).await;
    // Let the response side drain its trailers before tearing down.
    drop(inbound);
    let _ = outbound.join().await;
    Ok(())
}

/// Wire a (RecvStream, SendStream) pair into a byte stream via two pump
/// tasks. Dropping the returned guards tears the pumps down.
fn tun_pumps(
    mut body: h2::RecvStream,
    mut send: h2::SendStream<Bytes>,
) -> (GrpcTunStream, [ChildTask<()>; 2]) {
    let (incoming_tx, incoming_rx) = mpsc::channel::<Bytes>(16);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Bytes>(16);

    let inbound = ChildTask::spawn(async move {
        let mut decoder = FrameDecoder::default();
        while let Some(chunk) = body.data().await {
            let Ok(chunk) = chunk else { return };
            let _ = body.flow_control().release_capacity(chunk.len());
            decoder.feed(&chunk);
            loop {
                match decoder.next() {
                    Ok(Some(hunk)) => {
                        if incoming_tx.send(Bytes::from(hunk.data)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
        }
    });

    let outbound = ChildTask::spawn(async move {
        while let Some(payload) = outgoing_rx.recv().await {
            if send.send_data(encode_hunk(&payload), false).is_err() {
                return;
            }
        }
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
        let _ = send.send_trailers(trailers);
    });

    (GrpcTunStream::new(incoming_rx, outgoing_tx), [inbound, outbound])
}

/// Client side: open a `Tun` RPC toward `host:port` and return its payload
/// as a byte stream.
pub async fn dial(
    dialer: &Dialer,
    host: &str,
    port: u16,
    sni: &str,
    service_name: &str,
) -> anyhow::Result<GrpcTunStream> {
    let tcp = dialer.dial_tcp(host, port).await?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(sni.to_owned()).context("bad sni")?;
    let tls = connector.connect(server_name, tcp).await.context("tls connect")?;

    let (client, connection) = h2::client::handshake(tls).await.context("h2 handshake")?;
    ChildTask::spawn(async move {
        if let Err(error) = connection.await {
            debug!("h2 connection ended: {error}");
        }
    })
    .detach();
    let mut client = client.ready().await.context("h2 not ready")?;

    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(format!("https://{host}/{service_name}/Tun"))
        .header(http::header::CONTENT_TYPE, CONTENT_TYPE_GRPC)
        .header("te", "trailers")
        .body(())
        .context("build request")?;
    let (response, send) = client.send_request(request, false).context("send request")?;

    let (incoming_tx, incoming_rx) = mpsc::channel::<Bytes>(16);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Bytes>(16);

    ChildTask::spawn(async move {
        let Ok(response) = response.await else { return };
        let mut body = response.into_body();
        let mut decoder = FrameDecoder::default();
        while let Some(chunk) = body.data().await {
            let Ok(chunk) = chunk else { return };
            let _ = body.flow_control().release_capacity(chunk.len());
            decoder.feed(&chunk);
            loop {
                match decoder.next() {
                    Ok(Some(hunk)) => {
                        if incoming_tx.send(Bytes::from(hunk.data)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => return,
                }
            }
        }
    })
    .detach();

    let mut send = send;
    ChildTask::spawn(async move {
        while let Some(payload) = outgoing_rx.recv().await {
            if send.send_data(encode_hunk(&payload), false).is_err() {
                return;
            }
        }
        let _ = send.send_data(Bytes::new(), true);
    })
    .detach();

    Ok(GrpcTunStream::new(incoming_rx, outgoing_tx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_is_deterministic_and_wellformed() {
        let a = service_name_from_ticket("ticket-1");
        let b = service_name_from_ticket("ticket-1");
        assert_eq!(a, b);
        assert!((3..=12).contains(&a.len()));
        assert!(a.chars().next().expect("non-empty").is_ascii_alphabetic());

        let c = service_name_from_ticket("ticket-2");
        assert_ne!(a, c);
    }

    #[test]
    fn hunk_frame_round_trip() {
        let frame = encode_hunk(b"payload bytes");
        let mut decoder = FrameDecoder::default();

        // Feed in two pieces to exercise resumption.
        decoder.feed(&frame[..3]);
        assert!(decoder.next().expect("incomplete is fine").is_none());
        decoder.feed(&frame[3..]);
        let hunk = decoder.next().expect("decodes").expect("complete");
        assert_eq!(hunk.data, b"payload bytes");
        assert!(decoder.next().expect("empty").is_none());
    }

    #[tokio::test]
    async fn tun_stream_moves_bytes_both_ways() {
        let (incoming_tx, incoming_rx) = mpsc::channel(4);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(4);
        let mut stream = GrpcTunStream::new(incoming_rx, outgoing_tx);

        incoming_tx.send(Bytes::from_static(b"hello")).await.expect("send");
        drop(incoming_tx);

        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"hel");
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.expect("read");
        assert_eq!(rest, b"lo");

        stream.write_all(b"reply").await.expect("write");
        stream.shutdown().await.expect("shutdown");
        assert_eq!(outgoing_rx.recv().await.as_deref(), Some(b"reply".as_ref()));
        assert!(outgoing_rx.recv().await.is_none());
    }
}
