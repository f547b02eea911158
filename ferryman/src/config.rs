//! JSON configuration: the `lisa` (controller) and `john` (this node)
//! sections, with environment-variable overrides by underscored path.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::bandwidth::BandwidthLimitConf;

pub const CONFIG_FILE: &str = "ferryman.json";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8880";

pub const PROTOCOLS: &[&str] = &["shadowsocks", "vmess", "vmess+tls+grpc", "juicity"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LisaConf {
    /// Controller host.
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConf {
    /// trace, debug, info, warn or error.
    pub level: String,
    /// Log to this file instead of the console.
    pub file: Option<PathBuf>,
}

impl Default for LogConf {
    fn default() -> Self {
        LogConf {
            level: "warn".to_owned(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JohnConf {
    /// Address to listen on.
    pub listen: String,
    pub log: LogConf,
    pub protocol: String,
    /// Server name to register.
    pub name: String,
    /// Hostnames for users to connect, comma-separated.
    pub hostname: String,
    /// Port for users to connect; defaults to the listen port.
    pub port: u16,
    /// Ticket from the controller.
    pub ticket: String,
    pub no_relay: bool,
    /// Bytes drained from an unauthenticated peer before closing;
    /// -1 is unbounded.
    pub max_drain_n: i64,
    #[serde(rename = "doNotValidateCDN")]
    pub do_not_validate_cdn: bool,
    pub bandwidth_limit: BandwidthLimitConf,
}

impl Default for JohnConf {
    fn default() -> Self {
        JohnConf {
            listen: DEFAULT_LISTEN.to_owned(),
            log: LogConf::default(),
            protocol: "shadowsocks".to_owned(),
            name: String::new(),
            hostname: String::new(),
            port: 0,
            ticket: String::new(),
            no_relay: false,
            max_drain_n: -1,
            do_not_validate_cdn: false,
            bandwidth_limit: BandwidthLimitConf::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Conf {
    pub lisa: LisaConf,
    pub john: JohnConf,
}

impl Conf {
    pub fn hostnames(&self) -> Vec<String> {
        self.john
            .hostname
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn public_port(&self) -> u16 {
        if self.john.port != 0 {
            return self.john.port;
        }
        self.john
            .listen
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(0)
    }

    pub fn max_drain(&self) -> Option<u64> {
        u64::try_from(self.john.max_drain_n).ok()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.lisa.host.is_empty(), "lisa.host is required");
        anyhow::ensure!(!self.john.ticket.is_empty(), "john.ticket is required");
        anyhow::ensure!(!self.john.name.is_empty(), "john.name is required");
        anyhow::ensure!(!self.hostnames().is_empty(), "john.hostname is required");
        anyhow::ensure!(
            PROTOCOLS.contains(&self.john.protocol.as_str()),
            "unknown protocol {:?}, expected one of {:?}",
            self.john.protocol,
            PROTOCOLS
        );
        anyhow::ensure!(self.public_port() != 0, "john.port could not be derived");
        Ok(())
    }
}

/// Load the configuration: explicit path, `./ferryman.json`,
/// `$XDG_CONFIG_HOME/ferryman/`, `/etc/ferryman/` — first hit wins.
/// Environment variables override file values afterwards.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Conf> {
    let mut value = match find_config_file(explicit)? {
        Some(path) => {
            info!(path = %path.display(), "using config file");
            let content =
                std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| format!("parse {}", path.display()))?
        }
        None => {
            warn!("no config file found, using defaults and environment variables");
            serde_json::Value::Object(serde_json::Map::new())
        }
    };

    apply_env_overrides(&mut value, &|name| std::env::var(name).ok());
    serde_json::from_value(value).context("invalid configuration")
}

fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.exists(), "config file {} does not exist", path.display());
        return Ok(Some(path.to_owned()));
    }
    let mut candidates = vec![PathBuf::from(CONFIG_FILE)];
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        candidates.push(PathBuf::from(xdg).join("ferryman").join(CONFIG_FILE));
    } else if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".config").join("ferryman").join(CONFIG_FILE));
    }
    candidates.push(PathBuf::from("/etc/ferryman").join(CONFIG_FILE));
    Ok(candidates.into_iter().find(|p| p.exists()))
}

/// Known leaf paths, in `section.field` form. An environment variable named
/// after the path with dots replaced by underscores, uppercased, overrides
/// the file (`JOHN_LOG_LEVEL`, `LISA_HOST`, …).
const ENV_PATHS: &[&str] = &[
    "lisa.host",
    "john.listen",
    "john.log.level",
    "john.log.file",
    "john.protocol",
    "john.name",
    "john.hostname",
    "john.port",
    "john.ticket",
    "john.noRelay",
    "john.maxDrainN",
    "john.doNotValidateCDN",
    "john.bandwidthLimit.enable",
    "john.bandwidthLimit.resetDay",
    "john.bandwidthLimit.uplinkLimitGiB",
    "john.bandwidthLimit.downlinkLimitGiB",
    "john.bandwidthLimit.totalLimitGiB",
];

fn apply_env_overrides(value: &mut serde_json::Value, lookup: &dyn Fn(&str) -> Option<String>) {
    for path in ENV_PATHS {
        let env_name = path.replace('.', "_").to_uppercase();
        let Some(raw) = lookup(&env_name) else {
            continue;
        };
        let parsed = match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(v @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_))) => v,
            _ => serde_json::Value::String(raw),
        };
        let mut cursor = &mut *value;
        let segments: Vec<&str> = path.split('.').collect();
        for segment in &segments[..segments.len() - 1] {
            cursor = cursor
                .as_object_mut()
                .map(|map| {
                    map.entry((*segment).to_owned())
                        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()))
                })
                .expect("override tree is made of objects");
        }
        if let Some(map) = cursor.as_object_mut() {
            map.insert(segments[segments.len() - 1].to_owned(), parsed);
        }
    }
}

/// Directory for persisted state (bloom filters, certificates):
/// `/etc/ferryman` for root, the XDG data dir otherwise.
pub fn data_dir() -> PathBuf {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } == 0 {
            return PathBuf::from("/etc/ferryman");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("ferryman");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share").join("ferryman");
    }
    PathBuf::from(".").join("ferryman-data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_derived_port() {
        let conf: Conf = serde_json::from_str(
            r#"{ "lisa": {"host": "lisa.example.org"},
                 "john": {"listen": "0.0.0.0:18080", "protocol": "vmess",
                          "name": "n", "hostname": "a.example.org,b.example.org",
                          "ticket": "t"} }"#,
        )
        .expect("parse");
        assert_eq!(conf.public_port(), 18080);
        assert_eq!(conf.hostnames(), vec!["a.example.org", "b.example.org"]);
        assert_eq!(conf.john.max_drain_n, -1);
        assert_eq!(conf.max_drain(), None);
        conf.validate().expect("valid");
    }

    #[test]
    fn rejects_unknown_protocol() {
        let conf: Conf = serde_json::from_str(
            r#"{ "lisa": {"host": "h"},
                 "john": {"protocol": "socks5", "name": "n", "hostname": "h", "ticket": "t"} }"#,
        )
        .expect("parse");
        assert!(conf.validate().is_err());
    }

    #[test]
    fn env_overrides_follow_underscored_paths() {
        let mut value: serde_json::Value = serde_json::from_str(
            r#"{ "john": {"ticket": "from-file", "maxDrainN": -1} }"#,
        )
        .expect("parse");
        apply_env_overrides(&mut value, &|name| match name {
            "JOHN_TICKET" => Some("from-env".to_owned()),
            "JOHN_MAXDRAINN" => Some("1048576".to_owned()),
            "LISA_HOST" => Some("lisa.example.org".to_owned()),
            _ => None,
        });
        let conf: Conf = serde_json::from_value(value).expect("deserialize");
        assert_eq!(conf.john.ticket, "from-env");
        assert_eq!(conf.john.max_drain_n, 1_048_576);
        assert_eq!(conf.max_drain(), Some(1_048_576));
        assert_eq!(conf.lisa.host, "lisa.example.org");
    }
}
