//! Stream relaying.
//!
//! TCP relays copy both directions concurrently. When one direction hits
//! EOF, the opposite write side is half-closed and the remaining direction
//! gets a bounded grace period to drain before both ends are torn down.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::time::timeout;

pub const HALF_CLOSE_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_NAT_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// RFC 5452 guidance for the lifetime of one DNS exchange.
pub const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(17);

/// Bidirectional copy with half-close semantics. Returns the transferred
/// byte counts `(client_to_target, target_to_client)`.
pub async fn relay_tcp<A, B>(client: A, target: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut target_rd, mut target_wr) = tokio::io::split(target);

    let upload = async {
        let copied = tokio::io::copy(&mut client_rd, &mut target_wr).await;
        let _ = target_wr.shutdown().await;
        copied
    };
    let download = async {
        let copied = tokio::io::copy(&mut target_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        copied
    };
    tokio::pin!(upload);
    tokio::pin!(download);

    // Whichever direction ends first, the other gets the grace deadline.
    let (first, second) = tokio::select! {
        uploaded = &mut upload => (uploaded, drain_with_grace(download).await),
        downloaded = &mut download => (downloaded, drain_with_grace(upload).await),
    };

    match (first, second) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

async fn drain_with_grace<F>(direction: F) -> io::Result<u64>
where
    F: Future<Output = io::Result<u64>>,
{
    match timeout(HALF_CLOSE_GRACE, direction).await {
        Ok(result) => result,
        // Grace deadline elapsed; treat as a completed close.
        Err(_elapsed) => Ok(0),
    }
}

/// Pick the NAT timeout for a UDP flow by sniffing the first payload: DNS
/// exchanges cool off fast, everything else keeps the default.
pub fn select_timeout(packet: &[u8]) -> Duration {
    match hickory_proto::op::Message::from_vec(packet) {
        Ok(_) => DNS_QUERY_TIMEOUT,
        Err(_) => DEFAULT_NAT_TIMEOUT,
    }
}

/// Discard up to `max_n` bytes (`None` = unbounded) so an unauthenticated
/// peer cannot learn where parsing stopped.
pub async fn drain<R>(mut reader: R, max_n: Option<u64>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    match max_n {
        Some(limit) => {
            let mut taken = reader.take(limit);
            tokio::io::copy(&mut taken, &mut tokio::io::sink()).await
        }
        None => tokio::io::copy(&mut reader, &mut tokio::io::sink()).await,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt as _;

    use super::*;

    #[tokio::test]
    async fn relay_copies_both_directions_and_half_closes() {
        let (client, mut client_peer) = tokio::io::duplex(4096);
        let (target, mut target_peer) = tokio::io::duplex(4096);

        let relay = tokio::spawn(relay_tcp(client, target));

        client_peer.write_all(b"request").await.expect("write");
        let mut buf = [0u8; 7];
        target_peer.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"request");

        target_peer.write_all(b"response").await.expect("write");
        let mut buf = [0u8; 8];
        client_peer.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"response");

        // EOF from the client side propagates; the relay finishes once the
        // target side closes too.
        client_peer.shutdown().await.expect("shutdown");
        assert_eq!(target_peer.read_u8().await.ok(), None);
        target_peer.shutdown().await.expect("shutdown");

        let (up, down) = relay.await.expect("join").expect("relay");
        assert_eq!(up, 7);
        assert_eq!(down, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_direction_is_cut_after_grace() {
        let (client, mut client_peer) = tokio::io::duplex(4096);
        let (target, target_peer) = tokio::io::duplex(4096);

        let relay = tokio::spawn(relay_tcp(client, target));

        // Client finishes immediately; the target never sends EOF.
        client_peer.shutdown().await.expect("shutdown");

        tokio::time::advance(HALF_CLOSE_GRACE + Duration::from_secs(1)).await;
        let (up, down) = relay.await.expect("join").expect("relay");
        assert_eq!((up, down), (0, 0));
        drop((client_peer, target_peer));
    }

    #[tokio::test]
    async fn drain_respects_limit() {
        let data = vec![0u8; 4096];
        let n = drain(&data[..], Some(1024)).await.expect("drain");
        assert_eq!(n, 1024);
        let n = drain(&data[..], None).await.expect("drain");
        assert_eq!(n, 4096);
    }

    #[test]
    fn dns_payload_selects_short_timeout() {
        let mut query = hickory_proto::op::Message::new();
        query.add_query(hickory_proto::op::Query::query(
            hickory_proto::rr::Name::from_ascii("example.com.").expect("name"),
            hickory_proto::rr::RecordType::A,
        ));
        let bytes = query.to_vec().expect("encode");
        assert_eq!(select_timeout(&bytes), DNS_QUERY_TIMEOUT);
        assert_eq!(select_timeout(b"not dns"), DEFAULT_NAT_TIMEOUT);
    }
}
