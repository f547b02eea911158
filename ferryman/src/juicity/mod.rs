//! Juicity (TUIC-style over QUIC) front-end.

mod outbound;
pub mod proto;
mod server;

pub use outbound::{JuicityOutbound, cert_chain_hash};
pub use server::{JuicityPassage, JuicityServer, MANAGER_UUID};

/// Select the congestion controller; BBR is the default.
pub(crate) fn apply_congestion(transport: &mut quinn::TransportConfig, name: &str) {
    use quinn::congestion;
    use std::sync::Arc;

    match name {
        "cubic" => {
            transport.congestion_controller_factory(Arc::new(congestion::CubicConfig::default()));
        }
        "new_reno" => {
            transport.congestion_controller_factory(Arc::new(congestion::NewRenoConfig::default()));
        }
        other => {
            if other != "bbr" {
                warn!(congestion = other, "unknown congestion controller, using bbr");
            }
            transport.congestion_controller_factory(Arc::new(congestion::BbrConfig::default()));
        }
    }
}
