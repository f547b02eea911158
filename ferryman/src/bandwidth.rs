//! Bandwidth accounting from `/proc/net/dev`.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

const NET_DEV: &str = "/proc/net/dev";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BandwidthLimitConf {
    pub enable: bool,
    /// Day of month on which the limit resets; zero means never.
    pub reset_day: u8,
    #[serde(rename = "uplinkLimitGiB")]
    pub uplink_limit_gib: i64,
    #[serde(rename = "downlinkLimitGiB")]
    pub downlink_limit_gib: i64,
    #[serde(rename = "totalLimitGiB")]
    pub total_limit_gib: i64,
}

/// The `bandwidthLimit` object reported to the controller: the configured
/// limits plus live counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BandwidthLimit {
    pub reset_day: u8,
    #[serde(rename = "uplinkLimitGiB")]
    pub uplink_limit_gib: i64,
    #[serde(rename = "downlinkLimitGiB")]
    pub downlink_limit_gib: i64,
    #[serde(rename = "totalLimitGiB")]
    pub total_limit_gib: i64,
    #[serde(rename = "uplinkKiB")]
    pub uplink_kib: i64,
    #[serde(rename = "downlinkKiB")]
    pub downlink_kib: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub bandwidth_limit: BandwidthLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
}

/// Parse the two-header `/proc/net/dev` table.
pub fn parse_net_dev(content: &str) -> Vec<InterfaceCounters> {
    content
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 16 {
                return None;
            }
            Some(InterfaceCounters {
                name: name.trim().to_owned(),
                rx_bytes: fields[0].parse().ok()?,
                tx_bytes: fields[8].parse().ok()?,
            })
        })
        .collect()
}

fn is_physical(name: &str) -> bool {
    !(name == "lo"
        || name.starts_with("docker")
        || name.starts_with("veth")
        || name.starts_with("br-")
        || name.starts_with("virbr"))
}

/// Sum of (tx, rx) KiB across physical interfaces since boot.
pub fn current_usage_kib() -> anyhow::Result<(i64, i64)> {
    let content = std::fs::read_to_string(NET_DEV).context("read /proc/net/dev")?;
    let (tx, rx) = parse_net_dev(&content)
        .into_iter()
        .filter(|c| is_physical(&c.name))
        .fold((0i64, 0i64), |(tx, rx), c| (tx + c.tx_bytes, rx + c.rx_bytes));
    Ok((tx / 1024, rx / 1024))
}

/// The bandwidth report attached to register and ping payloads.
pub fn generate_bandwidth_limit(conf: &BandwidthLimitConf) -> anyhow::Result<BandwidthLimit> {
    if !conf.enable {
        return Ok(BandwidthLimit::default());
    }
    let (uplink_kib, downlink_kib) = current_usage_kib()?;
    Ok(BandwidthLimit {
        reset_day: conf.reset_day,
        uplink_limit_gib: conf.uplink_limit_gib,
        downlink_limit_gib: conf.downlink_limit_gib,
        total_limit_gib: conf.total_limit_gib,
        uplink_kib,
        downlink_kib,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1318415    3024    0    0    0     0          0         0  1318415    3024    0    0    0     0       0          0
  eth0: 98765432   54321    0    0    0     0          0         0  12345678    4321    0    0    0     0       0          0
";

    #[test]
    fn parses_interface_counters() {
        let counters = parse_net_dev(SAMPLE);
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[1].name, "eth0");
        assert_eq!(counters[1].rx_bytes, 98_765_432);
        assert_eq!(counters[1].tx_bytes, 12_345_678);
    }

    #[test]
    fn loopback_is_not_physical() {
        assert!(!is_physical("lo"));
        assert!(!is_physical("docker0"));
        assert!(is_physical("eth0"));
        assert!(is_physical("enp3s0"));
    }

    #[test]
    fn ping_response_shape() {
        let resp = PingResponse {
            bandwidth_limit: BandwidthLimit {
                reset_day: 1,
                uplink_limit_gib: 500,
                downlink_limit_gib: 500,
                total_limit_gib: 0,
                uplink_kib: 42,
                downlink_kib: 37,
            },
        };
        let json = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(json["bandwidthLimit"]["resetDay"], 1);
        assert_eq!(json["bandwidthLimit"]["uplinkLimitGiB"], 500);
        assert_eq!(json["bandwidthLimit"]["uplinkKiB"], 42);
    }
}
