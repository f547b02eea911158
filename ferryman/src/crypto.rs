//! AEAD cipher suite table and key-derivation helpers shared by the
//! protocol front-ends.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest as _, Md5};
use sha1::Sha1;

pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

const SS_SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Supported AEAD suites, keyed on the wire by their method string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20IetfPoly1305,
}

impl CipherKind {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "aes-128-gcm" => Some(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Some(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" => Some(CipherKind::ChaCha20IetfPoly1305),
            _ => None,
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20IetfPoly1305 => 32,
        }
    }

    /// Salt length equals key length for every supported suite.
    pub fn salt_len(self) -> usize {
        self.key_len()
    }

    pub fn new_cipher(self, key: &[u8]) -> AeadCipher {
        match self {
            CipherKind::Aes128Gcm => {
                AeadCipher::Aes128(Aes128Gcm::new_from_slice(key).expect("length checked by suite table"))
            }
            CipherKind::Aes256Gcm => {
                AeadCipher::Aes256(Aes256Gcm::new_from_slice(key).expect("length checked by suite table"))
            }
            CipherKind::ChaCha20IetfPoly1305 => {
                AeadCipher::ChaCha20(ChaCha20Poly1305::new_from_slice(key).expect("length checked by suite table"))
            }
        }
    }
}

/// A ready-to-use AEAD instance. Stateless per call; nonce management is the
/// caller's business (see [`NonceCounter`]).
pub enum AeadCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
    ChaCha20(ChaCha20Poly1305),
}

impl AeadCipher {
    pub fn seal(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
        let payload = Payload { msg: plaintext, aad };
        let nonce = Nonce::from_slice(nonce);
        let result = match self {
            AeadCipher::Aes128(c) => c.encrypt(nonce, payload),
            AeadCipher::Aes256(c) => c.encrypt(nonce, payload),
            AeadCipher::ChaCha20(c) => c.encrypt(nonce, payload),
        };
        result.expect("aead encryption is infallible for in-memory buffers")
    }

    /// Returns `None` when the tag does not verify.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Option<Vec<u8>> {
        let payload = Payload { msg: ciphertext, aad };
        let nonce = Nonce::from_slice(nonce);
        match self {
            AeadCipher::Aes128(c) => c.decrypt(nonce, payload).ok(),
            AeadCipher::Aes256(c) => c.decrypt(nonce, payload).ok(),
            AeadCipher::ChaCha20(c) => c.decrypt(nonce, payload).ok(),
        }
    }
}

/// OpenSSL's EVP_BytesToKey with MD5, used to derive the Shadowsocks master
/// key from the passage password.
pub fn evp_bytes_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut previous: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&previous);
        hasher.update(password.as_bytes());
        previous = hasher.finalize().to_vec();
        key.extend_from_slice(&previous);
    }
    key.truncate(key_len);
    key
}

/// HKDF-SHA1 subkey for one connection (TCP) or one packet (UDP).
pub fn derive_subkey(master_key: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut okm = vec![0u8; key_len];
    hk.expand(SS_SUBKEY_INFO, &mut okm)
        .expect("okm length is far below the hkdf limit");
    okm
}

/// Monotonic little-endian nonce, incremented after every seal/open.
pub struct NonceCounter {
    bytes: [u8; NONCE_LEN],
}

impl NonceCounter {
    pub fn new() -> Self {
        NonceCounter { bytes: [0; NONCE_LEN] }
    }

    pub fn current(&self) -> &[u8] {
        &self.bytes
    }

    pub fn increment(&mut self) {
        for b in &mut self.bytes {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
    }
}

impl Default for NonceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("aes-128-gcm", 16, 16)]
    #[case("aes-256-gcm", 32, 32)]
    #[case("chacha20-ietf-poly1305", 32, 32)]
    fn suite_table(#[case] method: &str, #[case] key_len: usize, #[case] salt_len: usize) {
        let kind = CipherKind::from_method(method).expect("known method");
        assert_eq!(kind.key_len(), key_len);
        assert_eq!(kind.salt_len(), salt_len);
        assert_eq!(kind.method(), method);
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(CipherKind::from_method("rc4-md5").is_none());
    }

    #[test]
    fn evp_bytes_to_key_reference_vector() {
        // MD5("foobar") followed by MD5(MD5("foobar") || "foobar"), truncated.
        let key = evp_bytes_to_key("foobar", 32);
        assert_eq!(
            hex::encode(&key[..16]),
            "3858f62230ac3c915f300c664312c63f"
        );
        assert_eq!(key.len(), 32);
        let again = evp_bytes_to_key("foobar", 16);
        assert_eq!(again, key[..16]);
    }

    #[test]
    fn nonce_counter_increments_little_endian() {
        let mut nonce = NonceCounter::new();
        for _ in 0..=255 {
            nonce.increment();
        }
        assert_eq!(nonce.current()[0], 0);
        assert_eq!(nonce.current()[1], 1);
    }

    #[test]
    fn seal_open_round_trip_all_suites() {
        for kind in [
            CipherKind::Aes128Gcm,
            CipherKind::Aes256Gcm,
            CipherKind::ChaCha20IetfPoly1305,
        ] {
            let key = vec![7u8; kind.key_len()];
            let cipher = kind.new_cipher(&key);
            let nonce = [0u8; NONCE_LEN];
            let sealed = cipher.seal(&nonce, b"attack at dawn", b"aad");
            assert_eq!(sealed.len(), 14 + TAG_LEN);
            let opened = cipher.open(&nonce, &sealed, b"aad").expect("tag verifies");
            assert_eq!(opened, b"attack at dawn");
            assert!(cipher.open(&nonce, &sealed, b"other").is_none());
        }
    }
}
