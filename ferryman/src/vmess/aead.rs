//! VMess AEAD key-derivation and the encrypted auth ID.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt as _, BlockEncrypt as _, KeyInit as _};
use crc::{CRC_32_ISO_HDLC, Crc};
use md5::{Digest as _, Md5};
use sha2::Sha256;

use crate::ProxyError;
use crate::replay::ReplayFilter;

pub const KDF_SALT_AUTH_ID_ENCRYPTION: &[u8] = b"AES Auth ID Encryption";
pub const KDF_SALT_HEADER_LEN_KEY: &[u8] = b"VMess Header AEAD Key_Length";
pub const KDF_SALT_HEADER_LEN_IV: &[u8] = b"VMess Header AEAD Nonce_Length";
pub const KDF_SALT_HEADER_KEY: &[u8] = b"VMess Header AEAD Key";
pub const KDF_SALT_HEADER_IV: &[u8] = b"VMess Header AEAD Nonce";
pub const KDF_SALT_RESP_LEN_KEY: &[u8] = b"AEAD Resp Header Len Key";
pub const KDF_SALT_RESP_LEN_IV: &[u8] = b"AEAD Resp Header Len IV";
pub const KDF_SALT_RESP_KEY: &[u8] = b"AEAD Resp Header Key";
pub const KDF_SALT_RESP_IV: &[u8] = b"AEAD Resp Header IV";

const KDF_ROOT_LABEL: &[u8] = b"VMess AEAD KDF";
const CMD_KEY_SUFFIX: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";
const HMAC_BLOCK: usize = 64;

/// Allowed clock skew for an auth ID, both directions.
pub const AUTH_ID_WINDOW_SECS: i64 = 120;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The per-identity command key: MD5(uuid ‖ fixed suffix).
pub fn cmd_key(uuid: &uuid::Uuid) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(uuid.as_bytes());
    hasher.update(CMD_KEY_SUFFIX);
    hasher.finalize().into()
}

fn sha256_once(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// One-shot HMAC where the compression function itself may be a nested HMAC
/// (the hash chain rooted at "VMess AEAD KDF"). Keys here never exceed the
/// block size.
fn hmac_once(key: &[u8], message: &[u8], hash: &dyn Fn(&[u8]) -> [u8; 32]) -> [u8; 32] {
    debug_assert!(key.len() <= HMAC_BLOCK);
    let mut ipad = [0x36u8; HMAC_BLOCK];
    let mut opad = [0x5cu8; HMAC_BLOCK];
    for (i, &b) in key.iter().enumerate() {
        ipad[i] ^= b;
        opad[i] ^= b;
    }
    let mut inner = Vec::with_capacity(HMAC_BLOCK + message.len());
    inner.extend_from_slice(&ipad);
    inner.extend_from_slice(message);
    let inner_digest = hash(&inner);
    let mut outer = Vec::with_capacity(HMAC_BLOCK + 32);
    outer.extend_from_slice(&opad);
    outer.extend_from_slice(&inner_digest);
    hash(&outer)
}

/// The VMess recursive KDF: each path label keys an HMAC whose underlying
/// hash is the previous level, rooted at HMAC-SHA256("VMess AEAD KDF").
pub fn kdf(key: &[u8], path: &[&[u8]]) -> [u8; 32] {
    fn level_digest(labels: &[&[u8]], data: &[u8]) -> [u8; 32] {
        match labels.split_last() {
            None => hmac_once(KDF_ROOT_LABEL, data, &sha256_once),
            Some((label, rest)) => hmac_once(label, data, &|d| level_digest(rest, d)),
        }
    }
    level_digest(path, key)
}

pub fn kdf16(key: &[u8], path: &[&[u8]]) -> [u8; 16] {
    kdf(key, path)[..16].try_into().expect("slice of 16")
}

pub fn kdf12(key: &[u8], path: &[&[u8]]) -> [u8; 12] {
    kdf(key, path)[..12].try_into().expect("slice of 12")
}

/// ChaCha20-Poly1305 body key expansion: MD5(k) ‖ MD5(MD5(k)).
pub fn chacha_body_key(key: &[u8; 16]) -> [u8; 32] {
    let first: [u8; 16] = Md5::digest(key).into();
    let second: [u8; 16] = Md5::digest(first).into();
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&first);
    out[16..].copy_from_slice(&second);
    out
}

fn auth_id_block(cmd_key: &[u8; 16]) -> Aes128 {
    let key = kdf16(cmd_key, &[KDF_SALT_AUTH_ID_ENCRYPTION]);
    Aes128::new(GenericArray::from_slice(&key))
}

/// Seal an auth ID for `timestamp`: `[ts_be64][rand32][crc32]` through
/// AES-128-ECB.
pub fn seal_auth_id(cmd_key: &[u8; 16], timestamp: i64, random: u32) -> [u8; 16] {
    let mut plain = [0u8; 16];
    plain[..8].copy_from_slice(&timestamp.to_be_bytes());
    plain[8..12].copy_from_slice(&random.to_be_bytes());
    let checksum = CRC32.checksum(&plain[..12]);
    plain[12..].copy_from_slice(&checksum.to_be_bytes());

    let mut block = GenericArray::clone_from_slice(&plain);
    auth_id_block(cmd_key).encrypt_block(&mut block);
    block.into()
}

/// Why a candidate key does not own an auth ID.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthIdRejection {
    /// The checksum does not verify: not this key. Try the next candidate.
    NotMatching,
    /// The key matches but the embedded timestamp is outside the window.
    Expired,
}

/// Decode an auth ID under one candidate key.
pub fn open_auth_id(
    cmd_key: &[u8; 16],
    eauth_id: &[u8; 16],
    now: i64,
    not_before: i64,
) -> Result<(), AuthIdRejection> {
    let mut block = GenericArray::clone_from_slice(eauth_id);
    auth_id_block(cmd_key).decrypt_block(&mut block);

    let checksum = u32::from_be_bytes(block[12..16].try_into().expect("block size"));
    if CRC32.checksum(&block[..12]) != checksum {
        return Err(AuthIdRejection::NotMatching);
    }
    let timestamp = i64::from_be_bytes(block[..8].try_into().expect("block size"));
    if (now - timestamp).abs() > AUTH_ID_WINDOW_SECS || timestamp < not_before {
        return Err(AuthIdRejection::Expired);
    }
    Ok(())
}

/// Full auth-ID admission: decode, window check, then insert-if-absent in
/// the replay filter.
pub fn admit_auth_id(
    cmd_key: &[u8; 16],
    eauth_id: &[u8; 16],
    now: i64,
    not_before: i64,
    filter: &ReplayFilter,
) -> Result<(), ProxyError> {
    match open_auth_id(cmd_key, eauth_id, now, not_before) {
        Ok(()) => {
            if !filter.insert(eauth_id) {
                return Err(ProxyError::ReplayAttack);
            }
            Ok(())
        }
        Err(AuthIdRejection::Expired) => Err(ProxyError::FailAuth),
        Err(AuthIdRejection::NotMatching) => Err(ProxyError::InvalidMetadata),
    }
}

/// FNV-1a over the instruction, 32-bit, appended as its checksum.
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in data {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
