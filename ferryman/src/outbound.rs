//! Outbound protocol selection for passages with an `out` leg.

use std::sync::Arc;

use crate::dialer::{Dialer, Outbound, OutboundCache, header_fingerprint};
use crate::juicity::JuicityOutbound;
use crate::passage::OutboundArg;
use crate::ss::SsOutbound;
use crate::vmess::{VmessOutbound, VmessTransport};

/// Pull one `key=value` pair out of a comma-separated method string
/// (`pinned_certchain_sha256=…`, `serviceName=…`).
pub fn method_param<'a>(method: &'a str, key: &str) -> Option<&'a str> {
    method.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

/// Build (or fetch from cache) the outbound dialer for `arg`.
///
/// Only Juicity legs are cached: their QUIC/TLS setup is the expensive part
/// the cache exists to amortise. The cache key is the full header
/// fingerprint, so rotated credentials never reuse a stale dialer.
pub fn select(arg: &OutboundArg, dialer: &Dialer, cache: &OutboundCache) -> anyhow::Result<Arc<dyn Outbound>> {
    let port: u16 = arg
        .port
        .parse()
        .map_err(|_| anyhow::anyhow!("bad outbound port {:?}", arg.port))?;

    match arg.protocol.as_str() {
        "shadowsocks" => Ok(Arc::new(SsOutbound::new(
            arg.host.clone(),
            port,
            &arg.method,
            &arg.password,
            dialer.clone(),
        )?)),
        "vmess" => Ok(Arc::new(VmessOutbound::new(
            arg.host.clone(),
            port,
            &arg.password,
            VmessTransport::Tcp,
            dialer.clone(),
        )?)),
        "vmess+tls+grpc" => {
            let service_name = method_param(&arg.method, "serviceName").unwrap_or("GunService");
            Ok(Arc::new(VmessOutbound::new(
                arg.host.clone(),
                port,
                &arg.password,
                VmessTransport::TlsGrpc {
                    sni: arg.host.clone(),
                    service_name: service_name.to_owned(),
                },
                dialer.clone(),
            )?))
        }
        "juicity" => {
            let fingerprint = header_fingerprint(arg);
            if let Some(cached) = cache.get(&fingerprint) {
                return Ok(cached);
            }
            let pinned = method_param(&arg.method, "pinned_certchain_sha256")
                .ok_or_else(|| anyhow::anyhow!("juicity outbound requires pinned_certchain_sha256"))?;
            let outbound: Arc<dyn Outbound> = Arc::new(JuicityOutbound::new(
                arg.host.clone(),
                port,
                &arg.username,
                &arg.password,
                pinned,
                dialer.clone(),
            )?);
            cache.insert(fingerprint, Arc::clone(&outbound));
            Ok(outbound)
        }
        other => anyhow::bail!("no outbound registered for protocol {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_param_parses_pairs() {
        let method = "pinned_certchain_sha256=abc123, serviceName=TunSvc";
        assert_eq!(method_param(method, "pinned_certchain_sha256"), Some("abc123"));
        assert_eq!(method_param(method, "serviceName"), Some("TunSvc"));
        assert_eq!(method_param(method, "missing"), None);
        assert_eq!(method_param("", "serviceName"), None);
    }
}
