//! Passage model: the credential records issued by the controller.

use std::time::Duration;

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Characters used for locally generated secrets.
pub const ALPHABET: &[u8] = b"qwertyuiopasdfghjklzxcvbnmQWERTYUIOPASDFGHJKLZXCVBNM0123456789";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundArg {
    /// Wire protocol of the inbound leg.
    #[serde(default)]
    pub protocol: String,
    /// Cipher suite for Shadowsocks; ignored for VMess where the UUID
    /// implies it.
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub password: String,
    /// Used as the UUID for Juicity.
    #[serde(default)]
    pub username: String,
    /// Non-empty iff this node is a relay target of another node.
    #[serde(default)]
    pub from: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundArg {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub username: String,
}

/// One credential record enabling one logical tunnel identity.
///
/// Immutable once inserted into a store; a rotation is remove + add.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Passage {
    /// Controller-side privileges. Manager secrets are generated locally on
    /// every insert and never originate from the controller verbatim.
    #[serde(default)]
    pub manager: bool,
    #[serde(rename = "in")]
    pub inbound: InboundArg,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out: Option<OutboundArg>,
}

/// Derived class; selects the contention cooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassageUse {
    User,
    Relay,
    Manager,
}

impl PassageUse {
    pub fn cooling(self) -> Duration {
        match self {
            PassageUse::User => Duration::ZERO,
            PassageUse::Relay => Duration::from_secs(90),
            PassageUse::Manager => Duration::from_secs(300),
        }
    }
}

impl Passage {
    pub fn use_class(&self) -> PassageUse {
        if self.manager {
            PassageUse::Manager
        } else if self.inbound.from.is_empty() {
            PassageUse::User
        } else {
            PassageUse::Relay
        }
    }

    /// Stable identity over `{protocol, method, password, username}`.
    ///
    /// Keys the store index, the contention cache and the sync diff. Fields
    /// are length-prefixed so adjacent values cannot collide.
    pub fn argument_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            &self.inbound.protocol,
            &self.inbound.method,
            &self.inbound.password,
            &self.inbound.username,
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// Random secret over [`ALPHABET`], nanoid-style.
pub fn generate_secret(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
