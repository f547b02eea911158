//! Service assembly: build the configured protocol front-end, wire up the
//! registrar and background loops, run until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Notify;

use crate::bandwidth::BandwidthLimitConf;
use crate::cdn::CdnRegistry;
use crate::config::{self, Conf};
use crate::dialer::Dialer;
use crate::juicity::JuicityServer;
use crate::msg::{ControlChannel, Liveness, PassageSync};
use crate::passage::Passage;
use crate::registrar::{CdnDriftWatch, NodeInfo, Registrar};
use crate::replay::{BloomGroup, FsyncMode, ReplayFilter};
use crate::ss::SsServer;
use crate::store::{LocalPassage, PassageStore};
use crate::task::{ChildTask, ShutdownHandle, ShutdownSignal, spawn_task};
use crate::tls::{CertifiedIdentity, cert_dir};
use crate::vmess::{VmessServer, grpc};

const CONTEXT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const VMESS_REPLAY_WINDOW: Duration = Duration::from_secs(120);

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: Arc<ShutdownHandle>,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        Tasks {
            inner: Vec::new(),
            shutdown_handle: Arc::new(shutdown_handle),
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: crate::task::Task<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.push(spawn_task(task, self.shutdown_signal.clone()));
    }

    fn spawn(&mut self, future: impl Future<Output = anyhow::Result<()>> + Send + 'static) {
        self.inner.push(ChildTask::spawn(future));
    }
}

/// Run the node until ctrl-c or a fatal condition.
pub async fn run(conf: Conf) -> anyhow::Result<()> {
    conf.validate()?;

    let data_dir = config::data_dir();
    let liveness = Liveness::new();
    let dialer = Dialer::new(true);
    let registry = Arc::new(CdnRegistry::with_known_cdns());
    let nudge = Arc::new(Notify::new());
    let mut tasks = Tasks::new();

    let listen: SocketAddr = conf
        .john
        .listen
        .parse()
        .with_context(|| format!("bad listen address {:?}", conf.john.listen))?;

    let mut node = NodeInfo {
        ticket: conf.john.ticket.clone(),
        name: conf.john.name.clone(),
        hostnames: conf.hostnames(),
        port: conf.public_port(),
        no_relay: conf.john.no_relay,
        protocol: conf.john.protocol.clone(),
        method: String::new(),
    };

    let sync: Arc<dyn PassageSync> = match conf.john.protocol.as_str() {
        "shadowsocks" => {
            let store = Arc::new(PassageStore::new());
            seed_manager(&store)?;
            let bloom = Arc::new(BloomGroup::open(&data_dir, FsyncMode::Never).context("open bloom filters")?);
            let control = ControlChannel::new(
                liveness.clone(),
                conf.john.bandwidth_limit.clone(),
                Arc::clone(&store) as Arc<dyn PassageSync>,
            );
            let server = Arc::new(SsServer::new(
                Arc::clone(&store),
                bloom,
                dialer.clone(),
                control,
                conf.max_drain(),
            ));

            let tcp = TcpListener::bind(listen).await.context("bind tcp listener")?;
            info!(addr = %listen, "shadowsocks listener started");
            let udp = UdpSocket::bind(listen).await.context("bind udp socket")?;

            let tcp_server = Arc::clone(&server);
            let tcp_signal = tasks.shutdown_signal.clone();
            tasks.spawn(async move { tcp_server.run_tcp(tcp, tcp_signal).await });
            let udp_server = Arc::clone(&server);
            let udp_signal = tasks.shutdown_signal.clone();
            tasks.spawn(async move { udp_server.run_udp(udp, udp_signal).await });

            spawn_context_sweep(&mut tasks, Arc::clone(&store));
            store
        }
        "vmess" => {
            let store = Arc::new(PassageStore::new());
            seed_manager(&store)?;
            let server = vmess_server(&conf, &store, &liveness, &dialer);

            let tcp = TcpListener::bind(listen).await.context("bind tcp listener")?;
            info!(addr = %listen, "vmess listener started");
            let signal = tasks.shutdown_signal.clone();
            tasks.spawn(async move { server.run_tcp(tcp, signal).await });

            spawn_context_sweep(&mut tasks, Arc::clone(&store));
            store
        }
        "vmess+tls+grpc" => {
            let store = Arc::new(PassageStore::new());
            seed_manager(&store)?;
            let server = vmess_server(&conf, &store, &liveness, &dialer);

            let hostname = conf.hostnames().into_iter().next().expect("validated non-empty");
            let identity = CertifiedIdentity::load_or_generate(&cert_dir(&data_dir), &hostname)?;
            let service_name = grpc::service_name_from_ticket(&conf.john.ticket);
            node.method = format!("serviceName={service_name}");

            let tunnel = Arc::new(grpc::GrpcTunnel::new(
                identity.h2_acceptor()?,
                &service_name,
                server,
                Arc::clone(&nudge),
            ));
            let tcp = TcpListener::bind(listen).await.context("bind tcp listener")?;
            info!(addr = %listen, service = %service_name, "vmess grpc listener started");
            let signal = tasks.shutdown_signal.clone();
            tasks.spawn(async move { tunnel.run(tcp, signal).await });

            spawn_context_sweep(&mut tasks, Arc::clone(&store));
            store
        }
        "juicity" => {
            let store = Arc::new(PassageStore::new());
            seed_manager(&store)?;

            let hostname = conf.hostnames().into_iter().next().expect("validated non-empty");
            let identity = CertifiedIdentity::load_or_generate(&cert_dir(&data_dir), &hostname)?;
            node.method = format!("pinned_certchain_sha256={}", identity.chain_hash_base64());

            let control = ControlChannel::new(
                liveness.clone(),
                conf.john.bandwidth_limit.clone(),
                Arc::clone(&store) as Arc<dyn PassageSync>,
            );
            let server = Arc::new(JuicityServer::new(
                Arc::clone(&store),
                dialer.clone(),
                control,
                identity,
                "bbr".to_owned(),
            ));
            let signal = tasks.shutdown_signal.clone();
            tasks.spawn(async move { server.run(listen, signal).await });

            spawn_context_sweep(&mut tasks, Arc::clone(&store));
            store
        }
        other => anyhow::bail!("unknown protocol {other:?}"),
    };

    let registrar = Registrar::new(
        conf.lisa.host.clone(),
        node,
        conf.john.bandwidth_limit.clone(),
        liveness.clone(),
        Arc::clone(&sync),
        Arc::clone(&registry),
        !conf.john.do_not_validate_cdn,
        Arc::clone(&nudge),
    );
    // First registration happens inline so a dead controller is visible at
    // startup; failures are retried by the background loop.
    if let Err(error) = registrar.register().await {
        warn!("initial registration failed: {error:#}");
        nudge.notify_one();
    }
    tasks.register(registrar);

    if !conf.john.do_not_validate_cdn {
        tasks.register(CdnDriftWatch {
            lisa_host: conf.lisa.host.clone(),
            registry,
            shutdown_handle: Arc::clone(&tasks.shutdown_handle),
        });
    }

    // Run until ctrl-c or until a task signals shutdown (cdn drift).
    let mut supervisor = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));
    let shutdown_handle = tasks.shutdown_handle;
    let mut shutdown_signal = tasks.shutdown_signal;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                shutdown_handle.signal();
                break;
            }
            _ = shutdown_signal.wait() => {
                break;
            }
            (result, _, rest) = &mut supervisor => {
                match result {
                    Ok(Ok(())) => trace!("a task terminated gracefully"),
                    Ok(Err(error)) => error!("a task failed: {error:#}"),
                    Err(error) => error!(%error, "a task panicked"),
                }
                if rest.is_empty() {
                    break;
                }
                supervisor = futures::future::select_all(rest);
            }
        }
    }

    shutdown_handle.signal();
    tokio::select! {
        _ = shutdown_handle.all_closed() => debug!("all tasks closed gracefully"),
        _ = tokio::time::sleep(Duration::from_secs(10)) => warn!("some tasks did not terminate in time"),
    }
    Ok(())
}

fn seed_manager<P: LocalPassage>(store: &Arc<PassageStore<P>>) -> anyhow::Result<()> {
    store.add_passages(vec![Passage {
        manager: true,
        ..Default::default()
    }])
}

fn vmess_server(
    conf: &Conf,
    store: &Arc<PassageStore<crate::vmess::VmessPassage>>,
    liveness: &Liveness,
    dialer: &Dialer,
) -> Arc<VmessServer> {
    let control = ControlChannel::new(
        liveness.clone(),
        conf.john.bandwidth_limit.clone(),
        Arc::clone(store) as Arc<dyn PassageSync>,
    );
    Arc::new(VmessServer::new(
        Arc::clone(store),
        Arc::new(ReplayFilter::new(VMESS_REPLAY_WINDOW)),
        dialer.clone(),
        control,
        conf.max_drain(),
    ))
}

fn spawn_context_sweep<P: LocalPassage>(tasks: &mut Tasks, store: Arc<PassageStore<P>>) {
    let mut signal = tasks.shutdown_signal.clone();
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CONTEXT_SWEEP_INTERVAL) => store.sweep_contexts(),
                _ = signal.wait() => return Ok(()),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_rejects_incomplete_config() {
        let conf = Conf::default();
        assert!(run(conf).await.is_err());
    }
}
