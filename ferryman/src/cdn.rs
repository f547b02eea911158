//! CDN validation: the controller host must sit behind a whitelisted CDN
//! whose configuration matches the expected templates, otherwise it could
//! observe client IPs.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use tokio::net::lookup_host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdnVerdict {
    Ok,
    /// The host resolves outside every known CDN range.
    NotFound,
    /// The CDN is reconfigured in a way that leaks client IPs. Fatal.
    CanStealIp,
    /// The check itself failed (API error, transient).
    FailedValidate,
}

#[derive(Debug, Clone)]
pub struct CdnJudgement {
    pub cdn_name: String,
    pub verdict: CdnVerdict,
}

/// One CDN's template check. Returns whether the zone configuration still
/// matches the expected rules.
#[async_trait]
pub trait CdnValidator: Send + Sync {
    async fn validate(&self, host: &str, token: &str) -> anyhow::Result<bool>;
}

struct CdnEntry {
    name: &'static str,
    ranges: Vec<IpNetwork>,
    validator: Arc<dyn CdnValidator>,
}

pub struct CdnRegistry {
    entries: Vec<CdnEntry>,
}

impl CdnRegistry {
    pub fn with_known_cdns() -> Self {
        let mut registry = CdnRegistry { entries: Vec::new() };
        registry.register(
            "cloudflare",
            cloudflare::CIDRS,
            Arc::new(cloudflare::Cloudflare::new()),
        );
        registry
    }

    pub fn register(&mut self, name: &'static str, cidrs: &[&str], validator: Arc<dyn CdnValidator>) {
        let ranges = cidrs
            .iter()
            .map(|cidr| cidr.parse().expect("static CIDR table is well-formed"))
            .collect();
        self.entries.push(CdnEntry {
            name,
            ranges,
            validator,
        });
    }

    fn entry_for(&self, ip: IpAddr) -> Option<&CdnEntry> {
        self.entries
            .iter()
            .find(|entry| entry.ranges.iter().any(|net| net.contains(ip)))
    }

    /// Resolve `host` and run the template check of every CDN its addresses
    /// belong to.
    pub async fn validate(&self, host: &str, token: &str) -> CdnJudgement {
        let host = host.trim_end_matches('.');
        let addrs = match lookup_host((host, 443)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect::<Vec<_>>(),
            Err(error) => {
                debug!(%host, %error, "controller host did not resolve");
                return CdnJudgement {
                    cdn_name: String::new(),
                    verdict: CdnVerdict::FailedValidate,
                };
            }
        };

        // The host may sit behind several CDNs at once; all must pass.
        let mut names: Vec<&'static str> = Vec::new();
        for ip in &addrs {
            match self.entry_for(*ip) {
                Some(entry) => {
                    if !names.contains(&entry.name) {
                        names.push(entry.name);
                    }
                }
                None => {
                    return CdnJudgement {
                        cdn_name: String::new(),
                        verdict: CdnVerdict::NotFound,
                    };
                }
            }
        }

        for name in &names {
            let entry = self
                .entries
                .iter()
                .find(|e| e.name == *name)
                .expect("name collected above");
            match entry.validator.validate(host, token).await {
                Ok(true) => {}
                Ok(false) => {
                    return CdnJudgement {
                        cdn_name: (*name).to_owned(),
                        verdict: CdnVerdict::CanStealIp,
                    };
                }
                Err(error) => {
                    debug!(cdn = name, %error, "cdn validation errored");
                    return CdnJudgement {
                        cdn_name: (*name).to_owned(),
                        verdict: CdnVerdict::FailedValidate,
                    };
                }
            }
        }
        CdnJudgement {
            cdn_name: names.join(", "),
            verdict: CdnVerdict::Ok,
        }
    }
}

mod cloudflare {
    use serde::Deserialize;

    use super::*;

    pub(super) const CIDRS: &[&str] = &[
        "173.245.48.0/20",
        "103.21.244.0/22",
        "103.22.200.0/22",
        "103.31.4.0/22",
        "141.101.64.0/18",
        "108.162.192.0/18",
        "190.93.240.0/20",
        "188.114.96.0/20",
        "197.234.240.0/22",
        "198.41.128.0/17",
        "162.158.0.0/15",
        "104.16.0.0/13",
        "104.24.0.0/14",
        "172.64.0.0/13",
        "131.0.72.0/22",
        "2400:cb00::/32",
        "2606:4700::/32",
        "2803:f800::/32",
        "2405:b500::/32",
        "2405:8100::/32",
        "2a06:98c0::/29",
        "2c0f:f248::/32",
    ];

    const API: &str = "https://api.cloudflare.com/client/v4";

    pub(super) struct Cloudflare {
        http: reqwest::Client,
    }

    #[derive(Deserialize)]
    struct ApiResponse<T> {
        success: bool,
        result: Option<T>,
    }

    #[derive(Deserialize)]
    struct Zone {
        id: String,
    }

    #[derive(Deserialize)]
    struct FirewallRule {
        paused: bool,
        action: String,
        filter: Filter,
    }

    #[derive(Deserialize)]
    struct Filter {
        paused: bool,
        expression: String,
    }

    impl Cloudflare {
        pub(super) fn new() -> Self {
            Cloudflare {
                http: reqwest::Client::new(),
            }
        }

        fn rule_matches(rule: &FirewallRule, hostname: &str) -> bool {
            let a = format!(r#"(ip.geoip.country eq "CN" and http.host eq "{hostname}")"#);
            let b = format!(r#"(http.host eq "{hostname}" and ip.geoip.country eq "CN")"#);
            !rule.paused
                && rule.action == "block"
                && !rule.filter.paused
                && (rule.filter.expression == a || rule.filter.expression == b)
        }
    }

    #[async_trait]
    impl CdnValidator for Cloudflare {
        async fn validate(&self, host: &str, token: &str) -> anyhow::Result<bool> {
            let labels: Vec<&str> = host.split('.').collect();
            anyhow::ensure!(labels.len() >= 2, "invalid domain: {host}");
            let zone_name = labels[labels.len() - 2..].join(".");

            let zones: ApiResponse<Vec<Zone>> = self
                .http
                .get(format!("{API}/zones"))
                .query(&[("name", zone_name.as_str())])
                .bearer_auth(token)
                .send()
                .await?
                .json()
                .await?;
            anyhow::ensure!(zones.success, "zone lookup failed");
            let zone = zones
                .result
                .and_then(|mut zones| (!zones.is_empty()).then(|| zones.remove(0)))
                .ok_or_else(|| anyhow::anyhow!("no zone named {zone_name}"))?;

            let rules: ApiResponse<Vec<FirewallRule>> = self
                .http
                .get(format!("{API}/zones/{}/firewall/rules", zone.id))
                .bearer_auth(token)
                .send()
                .await?
                .json()
                .await?;
            anyhow::ensure!(rules.success, "firewall rule listing failed");
            let rules = rules.result.unwrap_or_default();
            Ok(rules.iter().any(|rule| Self::rule_matches(rule, host)))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn rule_template_matching() {
            let rule = FirewallRule {
                paused: false,
                action: "block".to_owned(),
                filter: Filter {
                    paused: false,
                    expression: r#"(ip.geoip.country eq "CN" and http.host eq "node.example.org")"#.to_owned(),
                },
            };
            assert!(Cloudflare::rule_matches(&rule, "node.example.org"));
            assert!(!Cloudflare::rule_matches(&rule, "other.example.org"));

            let paused = FirewallRule {
                paused: true,
                ..rule
            };
            assert!(!Cloudflare::rule_matches(&paused, "node.example.org"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOk;

    #[async_trait]
    impl CdnValidator for AlwaysOk {
        async fn validate(&self, _host: &str, _token: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn unknown_ranges_yield_not_found() {
        // 127.0.0.1 is in no CDN range.
        let mut registry = CdnRegistry { entries: Vec::new() };
        registry.register("test-cdn", &["198.51.100.0/24"], Arc::new(AlwaysOk));
        let judgement = registry.validate("localhost", "token").await;
        assert_eq!(judgement.verdict, CdnVerdict::NotFound);
    }
}
