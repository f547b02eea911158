//! Shadowsocks/AEAD front-end.

mod codec;
mod outbound;
mod server;
mod udp;

pub use codec::{SsCodec, decrypt_udp_packet, encrypt_udp_packet};
pub use outbound::SsOutbound;
pub use server::{SsPassage, SsServer};

/// `[salt][encrypted length][length tag]` — the shortest prefix that lets a
/// probe decide whether a key matches, sized for the largest salt.
pub const BASIC_LEN: usize = 32 + 2 + 16;

/// Max plaintext bytes per TCP chunk.
pub const MAX_CHUNK: usize = 0x3FFF;
