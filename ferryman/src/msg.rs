//! Control channel between the node and the controller.
//!
//! Requests arrive over an already-authenticated tunnel as `Msg`-typed
//! metadata followed by a plaintext body. Only manager passages may speak
//! here; anything else is passage abuse and kills the connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ProxyError;
use crate::bandwidth::{BandwidthLimitConf, PingResponse, generate_bandwidth_limit};
use crate::metadata::MetadataCmd;
use crate::passage::Passage;

/// Bodies larger than this are nonsense from the controller and refused.
pub const MAX_MSG_BODY: u32 = 0xF_FFFF;

/// Last time the controller proved it can still reach us.
#[derive(Clone)]
pub struct Liveness {
    last_alive: Arc<Mutex<Instant>>,
}

impl Liveness {
    pub fn new() -> Self {
        Liveness {
            last_alive: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last_alive.lock() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.last_alive.lock().elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// The store surface the controller machinery needs: apply a pushed passage
/// set, and read back the locally generated manager credential.
pub trait PassageSync: Send + Sync {
    fn sync_passages(&self, passages: Vec<Passage>) -> anyhow::Result<()>;

    fn manager_passage(&self) -> Option<Passage>;
}

/// Shared control-channel state handed to every protocol front-end.
#[derive(Clone)]
pub struct ControlChannel {
    pub liveness: Liveness,
    pub bandwidth: BandwidthLimitConf,
    sync: Arc<dyn PassageSync>,
}

impl ControlChannel {
    pub fn new(liveness: Liveness, bandwidth: BandwidthLimitConf, sync: Arc<dyn PassageSync>) -> Self {
        ControlChannel {
            liveness,
            bandwidth,
            sync,
        }
    }

    /// Dispatch one control command; returns the response body.
    pub fn dispatch(&self, cmd: MetadataCmd, body: &[u8]) -> anyhow::Result<Vec<u8>> {
        match cmd {
            MetadataCmd::Ping => {
                if body != b"ping" {
                    warn!(body = %String::from_utf8_lossy(body), "unexpected ping body");
                }
                trace!("received a ping message");
                self.liveness.touch();
                let response = PingResponse {
                    bandwidth_limit: generate_bandwidth_limit(&self.bandwidth)?,
                };
                Ok(serde_json::to_vec(&response)?)
            }
            MetadataCmd::SyncPassages => {
                let passages: Vec<Passage> = serde_json::from_slice(body)?;
                info!(count = passages.len(), "controller asked to sync passages");
                // The controller never hands out manager credentials.
                let passages = passages
                    .into_iter()
                    .map(|mut p| {
                        p.manager = false;
                        p
                    })
                    .collect();
                self.sync.sync_passages(passages)?;
                Ok(b"OK".to_vec())
            }
            MetadataCmd::Response => Err(ProxyError::PassageAbuse("unexpected control command").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::passage::InboundArg;

    use super::*;

    struct RecordingSync {
        received: Mutex<Vec<Passage>>,
    }

    impl PassageSync for RecordingSync {
        fn sync_passages(&self, passages: Vec<Passage>) -> anyhow::Result<()> {
            *self.received.lock() = passages;
            Ok(())
        }

        fn manager_passage(&self) -> Option<Passage> {
            None
        }
    }

    fn channel() -> (ControlChannel, Arc<RecordingSync>) {
        let sync = Arc::new(RecordingSync {
            received: Mutex::new(Vec::new()),
        });
        let channel = ControlChannel::new(
            Liveness::new(),
            BandwidthLimitConf::default(),
            Arc::clone(&sync) as Arc<dyn PassageSync>,
        );
        (channel, sync)
    }

    #[test]
    fn ping_reports_bandwidth_and_touches_liveness() {
        let (channel, _) = channel();
        std::thread::sleep(Duration::from_millis(5));
        let before = channel.liveness.elapsed();
        let body = channel.dispatch(MetadataCmd::Ping, b"ping").expect("ping");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert!(parsed.get("bandwidthLimit").is_some());
        assert!(channel.liveness.elapsed() < before);
    }

    #[test]
    fn sync_demotes_manager_flag() {
        let (channel, sync) = channel();
        let pushed = vec![Passage {
            manager: true,
            inbound: InboundArg {
                protocol: "vmess".to_owned(),
                password: "28446de9-2a7e-4fab-827b-6df93e46f945".to_owned(),
                ..Default::default()
            },
            out: None,
        }];
        let body = serde_json::to_vec(&pushed).expect("serialize");
        let resp = channel.dispatch(MetadataCmd::SyncPassages, &body).expect("sync");
        assert_eq!(resp, b"OK");
        let received = sync.received.lock();
        assert_eq!(received.len(), 1);
        assert!(!received[0].manager);
    }

    #[test]
    fn response_command_is_abuse() {
        let (channel, _) = channel();
        let err = channel.dispatch(MetadataCmd::Response, b"").expect_err("refused");
        assert!(matches!(
            err.downcast_ref::<ProxyError>(),
            Some(ProxyError::PassageAbuse(_))
        ));
    }
}
