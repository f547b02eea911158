//! Shadowsocks UDP path: per-packet codec and the NAT map.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant, timeout};

use crate::ProxyError;
use crate::dialer::sanitize_dns_response;
use crate::metadata::Metadata;
use crate::pool;
use crate::relay::select_timeout;
use crate::ss::codec::{decrypt_udp_packet, encrypt_udp_packet};
use crate::ss::server::{SsPassage, SsServer};
use crate::store::LocalPassage;
use crate::task::{ChildTask, ShutdownSignal};

pub(super) const UDP_MTU: usize = 65_535;

/// One client⇄target flow: the outbound socket plus its idle bookkeeping.
struct UdpFlow {
    socket: Arc<UdpSocket>,
    nat_timeout: Duration,
    last_activity: Mutex<Instant>,
    is_dns: bool,
}

impl UdpFlow {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn remaining(&self) -> Duration {
        self.nat_timeout
            .saturating_sub(self.last_activity.lock().elapsed())
    }
}

/// NAT map keyed on `(client address, target)`.
#[derive(Default)]
pub(super) struct UdpNatMap {
    flows: Mutex<HashMap<(SocketAddr, String), Arc<UdpFlow>>>,
}

impl SsServer {
    pub async fn run_udp(
        self: Arc<Self>,
        socket: UdpSocket,
        mut shutdown: ShutdownSignal,
    ) -> anyhow::Result<()> {
        let socket = Arc::new(socket);
        let mut buf = pool::get(UDP_MTU);
        loop {
            let received = tokio::select! {
                received = socket.recv_from(&mut buf) => received,
                _ = shutdown.wait() => return Ok(()),
            };
            let (n, client) = match received {
                Ok(pair) => pair,
                Err(error) => {
                    warn!(%error, "udp recv failed");
                    continue;
                }
            };
            let datagram = buf[..n].to_vec();
            let server = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            ChildTask::spawn(async move {
                if let Err(error) = server.handle_udp(&socket, client, datagram).await {
                    match error.downcast_ref::<ProxyError>() {
                        Some(ProxyError::FailAuth) => debug!(%client, "udp auth fail"),
                        _ => info!(%client, "udp packet failed: {error:#}"),
                    }
                }
            })
            .detach();
        }
    }

    async fn handle_udp(
        &self,
        listener: &Arc<UdpSocket>,
        client: SocketAddr,
        datagram: Vec<u8>,
    ) -> anyhow::Result<()> {
        let context = self.store().user_context(client.ip());
        let Some((passage, plaintext)) = context.auth(|p| decrypt_udp_packet(p.kind(), p.master_key(), &datagram))
        else {
            return Err(ProxyError::FailAuth.into());
        };

        // Relay leg: hand the untouched datagram to the next node.
        if let Some(out) = &passage.passage().out {
            let port: u16 = out.port.parse().map_err(|_| ProxyError::InvalidAddress)?;
            let target = self.dialer().resolve_udp(&out.host, port).await?;
            let flow = self
                .forward_flow(listener, client, format!("relay:{target}"), target, &plaintext, Arc::clone(&passage), true)
                .await?;
            flow.socket.send_to(&datagram, target).await?;
            flow.touch();
            return Ok(());
        }

        let metadata = Metadata::decode(&plaintext)?;
        if metadata.is_msg() {
            return Err(ProxyError::InvalidMetadata.into());
        }
        let header_len = Metadata::wire_size(&plaintext)?;
        let payload = &plaintext[header_len..];

        let (host, port) = metadata.dial_address();
        let target = self.dialer().resolve_udp(&host, port).await?;
        let flow = self
            .forward_flow(listener, client, format!("{host}:{port}"), target, payload, Arc::clone(&passage), false)
            .await?;
        flow.socket.send_to(payload, target).await?;
        flow.touch();
        Ok(())
    }

    /// Get or create the outbound flow for `(client, target)`, spawning its
    /// reverse pump on creation.
    #[allow(clippy::too_many_arguments)]
    async fn forward_flow(
        &self,
        listener: &Arc<UdpSocket>,
        client: SocketAddr,
        flow_label: String,
        target: SocketAddr,
        first_payload: &[u8],
        passage: Arc<SsPassage>,
        raw_passthrough: bool,
    ) -> anyhow::Result<Arc<UdpFlow>> {
        let key = (client, flow_label);
        if let Some(flow) = self.nat().flows.lock().get(&key) {
            flow.touch();
            return Ok(Arc::clone(flow));
        }

        let socket = Arc::new(self.dialer().bind_udp(&target).await?);
        let flow = Arc::new(UdpFlow {
            socket,
            nat_timeout: select_timeout(first_payload),
            last_activity: Mutex::new(Instant::now()),
            is_dns: select_timeout(first_payload) == crate::relay::DNS_QUERY_TIMEOUT,
        });
        self.nat().flows.lock().insert(key.clone(), Arc::clone(&flow));

        let listener = Arc::clone(listener);
        let nat = self.nat_handle();
        let pump_flow = Arc::clone(&flow);
        ChildTask::spawn(async move {
            let _ = reverse_pump(&pump_flow, &listener, client, target, passage, raw_passthrough).await;
            nat.flows.lock().remove(&key);
        })
        .detach();

        Ok(flow)
    }
}

/// Copy reverse packets back to the client until the NAT timeout expires.
async fn reverse_pump(
    flow: &UdpFlow,
    listener: &UdpSocket,
    client: SocketAddr,
    target: SocketAddr,
    passage: Arc<SsPassage>,
    raw_passthrough: bool,
) -> anyhow::Result<()> {
    let mut buf = pool::get(UDP_MTU);
    loop {
        let remaining = flow.remaining();
        if remaining.is_zero() {
            return Ok(());
        }
        let Ok(received) = timeout(remaining, flow.socket.recv_from(&mut buf)).await else {
            continue; // re-check the deadline; a forward may have refreshed it
        };
        let (n, from) = received?;
        flow.touch();

        if raw_passthrough {
            listener.send_to(&buf[..n], client).await?;
            continue;
        }

        let mut payload = buf[..n].to_vec();
        if flow.is_dns {
            if let Some(rewritten) = sanitize_dns_response(&payload) {
                warn!(%target, "dns response rewritten: answer pointed at private space");
                payload = rewritten;
            }
        }
        let mut wrapped = Metadata::target(&from.ip().to_string(), from.port()).encode();
        wrapped.extend_from_slice(&payload);
        let shadowed = encrypt_udp_packet(passage.kind(), passage.master_key(), &wrapped);
        listener.send_to(&shadowed, client).await?;
    }
}
