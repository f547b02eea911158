//! Controller registrar: registration, keepalive and CDN drift watching.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::bandwidth::{BandwidthLimit, BandwidthLimitConf, generate_bandwidth_limit};
use crate::cdn::{CdnRegistry, CdnVerdict};
use crate::msg::{Liveness, PassageSync};
use crate::passage::Passage;
use crate::task::{Backoff, ShutdownHandle, ShutdownSignal, Task};

/// Re-register once the controller has been silent this long.
pub const LOST_THRESHOLD: Duration = Duration::from_secs(5 * 60);
const KEEPALIVE_TICK: Duration = Duration::from_secs(2);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(600);
const DRIFT_INTERVAL: Duration = Duration::from_secs(30);
const DRIFT_ESCALATE_AFTER: u32 = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RegisterRequest {
    pub ticket: String,
    pub name: String,
    pub hosts: Vec<String>,
    pub port: u16,
    pub argument: RegisterArgument,
    pub bandwidth_limit: BandwidthLimit,
    pub no_relay: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RegisterArgument {
    pub protocol: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    code: String,
    #[serde(default)]
    data: Vec<Passage>,
    #[serde(default)]
    message: String,
}

/// Static facts about this node, straight from the config.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub ticket: String,
    pub name: String,
    pub hostnames: Vec<String>,
    pub port: u16,
    pub no_relay: bool,
    pub protocol: String,
    /// Extra `method` content for the registration argument
    /// (`pinned_certchain_sha256=…`, `serviceName=…`).
    pub method: String,
}

pub struct Registrar {
    http: reqwest::Client,
    lisa_host: String,
    node: NodeInfo,
    bandwidth: BandwidthLimitConf,
    liveness: Liveness,
    sync: Arc<dyn PassageSync>,
    registry: Arc<CdnRegistry>,
    validate_cdn: bool,
    /// Poked by transports that suspect a stale certificate.
    nudge: Arc<Notify>,
}

impl Registrar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lisa_host: String,
        node: NodeInfo,
        bandwidth: BandwidthLimitConf,
        liveness: Liveness,
        sync: Arc<dyn PassageSync>,
        registry: Arc<CdnRegistry>,
        validate_cdn: bool,
        nudge: Arc<Notify>,
    ) -> Self {
        Registrar {
            http: reqwest::Client::new(),
            lisa_host,
            node,
            bandwidth,
            liveness,
            sync,
            registry,
            validate_cdn,
            nudge,
        }
    }

    async fn validation_token(&self) -> String {
        let name = format!("cdn-validate.{}", self.lisa_host);
        let Ok(resolver) = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf() else {
            return String::new();
        };
        match resolver.txt_lookup(name).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<String>()
                })
                .unwrap_or_default(),
            Err(error) => {
                debug!(%error, "validation token lookup failed");
                String::new()
            }
        }
    }

    /// One registration round trip. A successful response carries the
    /// current passage list, which replaces the local non-manager set.
    pub async fn register(&self) -> anyhow::Result<()> {
        let token = self.validation_token().await;

        if self.validate_cdn {
            let judgement = self.registry.validate(&self.lisa_host, &token).await;
            match judgement.verdict {
                CdnVerdict::Ok => {}
                verdict => anyhow::bail!("controller host failed cdn validation: {verdict:?}"),
            }
        }

        let manager = self
            .sync
            .manager_passage()
            .context("no manager passage to register with")?;
        let request = RegisterRequest {
            ticket: self.node.ticket.clone(),
            name: self.node.name.clone(),
            hosts: self.node.hostnames.clone(),
            port: self.node.port,
            argument: RegisterArgument {
                protocol: self.node.protocol.clone(),
                username: manager.inbound.username.clone(),
                password: manager.inbound.password.clone(),
                method: self.node.method.clone(),
            },
            bandwidth_limit: generate_bandwidth_limit(&self.bandwidth)?,
            no_relay: self.node.no_relay,
        };

        let url = format!(
            "https://{}/api/ticket/{}/register",
            self.lisa_host, self.node.ticket
        );
        let response: RegisterResponse = self
            .http
            .post(&url)
            .timeout(REGISTER_TIMEOUT)
            .json(&request)
            .send()
            .await
            .context("send register request")?
            .json()
            .await
            .context("decode register response")?;
        anyhow::ensure!(response.code == "SUCCESS", "register refused: {}", response.message);

        info!(host = %self.lisa_host, "registered at the controller");
        self.liveness.touch();

        let passages = response
            .data
            .into_iter()
            .map(|mut p| {
                p.manager = false;
                p
            })
            .collect();
        self.sync.sync_passages(passages)
    }
}

#[async_trait]
impl Task for Registrar {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "registrar";

    async fn run(self, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
        let mut backoff = Backoff::new(BACKOFF_INITIAL, BACKOFF_MAX);
        let mut wait = KEEPALIVE_TICK;
        loop {
            let mut forced = false;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.nudge.notified() => {
                    info!("re-registration requested");
                    forced = true;
                }
                _ = shutdown.wait() => return Ok(()),
            }
            if !forced && self.liveness.elapsed() < LOST_THRESHOLD {
                wait = KEEPALIVE_TICK;
                continue;
            }
            if self.liveness.elapsed() >= LOST_THRESHOLD {
                warn!(
                    "lost contact with the controller for more than {}, registering again",
                    humantime::format_duration(LOST_THRESHOLD)
                );
            }
            match self.register().await {
                Ok(()) => {
                    backoff.reset();
                    wait = KEEPALIVE_TICK;
                }
                Err(error) => {
                    wait = backoff.next_delay();
                    warn!(
                        "registration failed: {error:#}; retrying in {}",
                        humantime::format_duration(wait)
                    );
                }
            }
        }
    }
}

/// Independent 30-second loop revalidating the controller's CDN setup. A
/// `CanStealIP` verdict shuts the node down.
pub struct CdnDriftWatch {
    pub lisa_host: String,
    pub registry: Arc<CdnRegistry>,
    pub shutdown_handle: Arc<ShutdownHandle>,
}

#[async_trait]
impl Task for CdnDriftWatch {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "cdn-drift-watch";

    async fn run(self, mut shutdown: ShutdownSignal) -> anyhow::Result<()> {
        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(DRIFT_INTERVAL) => {}
                _ = shutdown.wait() => return Ok(()),
            }
            let judgement = self.registry.validate(&self.lisa_host, "").await;
            match judgement.verdict {
                CdnVerdict::Ok | CdnVerdict::NotFound => {
                    consecutive_failures = 0;
                }
                CdnVerdict::CanStealIp => {
                    error!(
                        cdn = %judgement.cdn_name,
                        "controller cdn can steal client addresses, shutting down"
                    );
                    self.shutdown_handle.signal();
                    return Err(anyhow::anyhow!("cdn drift: CanStealIP"));
                }
                CdnVerdict::FailedValidate => {
                    consecutive_failures += 1;
                    if consecutive_failures >= DRIFT_ESCALATE_AFTER {
                        error!(consecutive_failures, "cdn validation keeps failing");
                    } else {
                        warn!("cdn validation failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_shape() {
        let request = RegisterRequest {
            ticket: "t-123".to_owned(),
            name: "node-1".to_owned(),
            hosts: vec!["a.example.org".to_owned(), "b.example.org".to_owned()],
            port: 443,
            argument: RegisterArgument {
                protocol: "juicity".to_owned(),
                username: "00000000-0000-0000-0000-000000000000".to_owned(),
                password: "pw".to_owned(),
                method: "pinned_certchain_sha256=abc".to_owned(),
            },
            bandwidth_limit: BandwidthLimit::default(),
            no_relay: true,
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["ticket"], "t-123");
        assert_eq!(json["no_relay"], true);
        assert_eq!(json["argument"]["protocol"], "juicity");
        assert!(json.get("bandwidth_limit").is_some());
    }

    #[test]
    fn register_response_parses_success_and_failure() {
        let ok: RegisterResponse = serde_json::from_str(
            r#"{"code":"SUCCESS","data":[{"in":{"protocol":"vmess","password":"28446de9-2a7e-4fab-827b-6df93e46f945"}}],"message":""}"#,
        )
        .expect("parse");
        assert_eq!(ok.code, "SUCCESS");
        assert_eq!(ok.data.len(), 1);

        let refused: RegisterResponse =
            serde_json::from_str(r#"{"code":"TICKET_INVALID","message":"no such ticket"}"#).expect("parse");
        assert_eq!(refused.code, "TICKET_INVALID");
        assert_eq!(refused.message, "no such ticket");
        assert!(refused.data.is_empty());
    }
}
