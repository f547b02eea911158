//! Shadowsocks AEAD framing.
//!
//! TCP: `[salt][enc(len u16 BE)][tag][enc(payload)][tag]…`, payload capped
//! at 0x3FFF, per-direction nonce starting at zero and incremented
//! little-endian after every seal/open.
//!
//! UDP: `[salt][enc(payload)][tag]` with a zero nonce; every packet derives
//! an independent subkey from its own salt.

use std::io;
use std::sync::Arc;

use rand::RngCore as _;

use crate::ProxyError;
use crate::cipher_stream::{Chunk, ChunkCodec, ReadInit};
use crate::crypto::{AeadCipher, CipherKind, NonceCounter, TAG_LEN, derive_subkey};
use crate::replay::BloomGroup;
use crate::ss::MAX_CHUNK;

struct DirectionState {
    cipher: AeadCipher,
    nonce: NonceCounter,
}

pub struct SsCodec {
    kind: CipherKind,
    master_key: Vec<u8>,
    read: Option<DirectionState>,
    write: Option<DirectionState>,
    /// When set, read-side salts are checked against the replay filter and
    /// write-side salts are recorded into it.
    bloom: Option<Arc<BloomGroup>>,
}

impl SsCodec {
    /// Client leg: both directions derive their state lazily from salts.
    pub fn client(kind: CipherKind, master_key: Vec<u8>) -> Self {
        SsCodec {
            kind,
            master_key,
            read: None,
            write: None,
            bloom: None,
        }
    }

    /// Server leg: the read salt was consumed during auth probing, so the
    /// read cipher starts ready; pass the raw bytes read past the salt back
    /// in through [`crate::cipher_stream::CipherStream::preread`].
    pub fn server(kind: CipherKind, master_key: Vec<u8>, read_salt: &[u8], bloom: Arc<BloomGroup>) -> Self {
        let subkey = derive_subkey(&master_key, read_salt, kind.key_len());
        SsCodec {
            kind,
            master_key,
            read: Some(DirectionState {
                cipher: kind.new_cipher(&subkey),
                nonce: NonceCounter::new(),
            }),
            write: None,
            bloom: Some(bloom),
        }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }
}

impl ChunkCodec for SsCodec {
    fn read_init(&self) -> ReadInit {
        match self.read {
            Some(_) => ReadInit::Ready,
            None => ReadInit::Need(self.kind.salt_len()),
        }
    }

    fn read_init_feed(&mut self, salt: &[u8]) -> io::Result<()> {
        if let Some(bloom) = &self.bloom {
            if bloom.exist_or_add(salt) {
                return Err(io::Error::other(ProxyError::ReplayAttack));
            }
        }
        let subkey = derive_subkey(&self.master_key, salt, self.kind.key_len());
        self.read = Some(DirectionState {
            cipher: self.kind.new_cipher(&subkey),
            nonce: NonceCounter::new(),
        });
        Ok(())
    }

    fn len_block_size(&self) -> usize {
        2 + TAG_LEN
    }

    fn decode_len(&mut self, block: &[u8]) -> io::Result<usize> {
        let state = self.read.as_mut().expect("read side initialized");
        let opened = state
            .cipher
            .open(state.nonce.current(), block, &[])
            .ok_or_else(|| io::Error::other(ProxyError::FailAuth))?;
        state.nonce.increment();
        let len = usize::from(u16::from_be_bytes([opened[0], opened[1]])) & MAX_CHUNK;
        Ok(len + TAG_LEN)
    }

    fn open_chunk(&mut self, block: &[u8]) -> io::Result<Chunk> {
        let state = self.read.as_mut().expect("read side initialized");
        let payload = state
            .cipher
            .open(state.nonce.current(), block, &[])
            .ok_or_else(|| io::Error::other(ProxyError::FailAuth))?;
        state.nonce.increment();
        Ok(Chunk::Data(payload))
    }

    fn write_prefix(&mut self) -> io::Result<Vec<u8>> {
        let mut salt = vec![0u8; self.kind.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        if let Some(bloom) = &self.bloom {
            bloom.exist_or_add(&salt);
        }
        let subkey = derive_subkey(&self.master_key, &salt, self.kind.key_len());
        self.write = Some(DirectionState {
            cipher: self.kind.new_cipher(&subkey),
            nonce: NonceCounter::new(),
        });
        Ok(salt)
    }

    fn max_payload(&self) -> usize {
        MAX_CHUNK
    }

    fn seal_chunk(&mut self, payload: &[u8]) -> Vec<u8> {
        debug_assert!(payload.len() <= MAX_CHUNK);
        let state = self.write.as_mut().expect("prefix written first");
        let mut out = Vec::with_capacity(2 + TAG_LEN + payload.len() + TAG_LEN);
        let len_bytes = (payload.len() as u16).to_be_bytes();
        out.extend_from_slice(&state.cipher.seal(state.nonce.current(), &len_bytes, &[]));
        state.nonce.increment();
        out.extend_from_slice(&state.cipher.seal(state.nonce.current(), payload, &[]));
        state.nonce.increment();
        out
    }

    fn seal_terminal(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// Seal one UDP payload: fresh salt, zero nonce.
pub fn encrypt_udp_packet(kind: CipherKind, master_key: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; kind.salt_len()];
    rand::thread_rng().fill_bytes(&mut out);
    let subkey = derive_subkey(master_key, &out, kind.key_len());
    let cipher = kind.new_cipher(&subkey);
    out.extend_from_slice(&cipher.seal(&[0u8; crate::crypto::NONCE_LEN], payload, &[]));
    out
}

/// Open one UDP packet; `None` when the key does not match.
pub fn decrypt_udp_packet(kind: CipherKind, master_key: &[u8], packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < kind.salt_len() + TAG_LEN {
        return None;
    }
    let (salt, sealed) = packet.split_at(kind.salt_len());
    let subkey = derive_subkey(master_key, salt, kind.key_len());
    let cipher = kind.new_cipher(&subkey);
    cipher.open(&[0u8; crate::crypto::NONCE_LEN], sealed, &[])
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use crate::cipher_stream::CipherStream;
    use crate::crypto::evp_bytes_to_key;

    use super::*;

    fn master(kind: CipherKind) -> Vec<u8> {
        evp_bytes_to_key("oKLW52IDIZKQ3QXHS434N", kind.key_len())
    }

    #[tokio::test]
    async fn tcp_frames_round_trip_across_chunk_boundaries() {
        for kind in [
            CipherKind::Aes128Gcm,
            CipherKind::Aes256Gcm,
            CipherKind::ChaCha20IetfPoly1305,
        ] {
            let key = master(kind);
            let (near, far) = tokio::io::duplex(1 << 20);
            let mut alice = CipherStream::new(near, SsCodec::client(kind, key.clone()));
            let mut bob = CipherStream::new(far, SsCodec::client(kind, key));

            // Spans several 0x3FFF chunks.
            let message: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
            let expected = message.clone();
            let writer = tokio::spawn(async move {
                alice.write_all(&message).await.expect("write");
                alice.flush().await.expect("flush");
                alice.shutdown().await.expect("shutdown");
            });

            let mut received = Vec::new();
            bob.read_to_end(&mut received).await.expect("read");
            assert_eq!(received, expected, "{kind:?}");
            writer.await.expect("join");
        }
    }

    #[tokio::test]
    async fn tampered_frame_fails_auth() {
        let kind = CipherKind::Aes128Gcm;
        let key = master(kind);
        let (near, far) = tokio::io::duplex(1 << 16);
        let mut alice = CipherStream::new(near, SsCodec::client(kind, key.clone()));
        alice.write_all(b"hello").await.expect("write");
        alice.flush().await.expect("flush");

        // Flip one ciphertext bit on the wire.
        let mut raw = alice.into_inner();
        raw.write_all(&[0u8; 2 + TAG_LEN]).await.expect("garbage");

        let mut bob = CipherStream::new(far, SsCodec::client(kind, key));
        let mut received = vec![0u8; 5];
        bob.read_exact(&mut received).await.expect("first chunk ok");
        assert_eq!(&received, b"hello");
        let err = bob.read_u8().await.expect_err("garbage must not authenticate");
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<ProxyError>());
        assert!(matches!(inner, Some(ProxyError::FailAuth)));
    }

    #[test]
    fn udp_packet_round_trip() {
        let kind = CipherKind::Aes256Gcm;
        let key = master(kind);
        let packet = encrypt_udp_packet(kind, &key, b"datagram");
        assert_eq!(packet.len(), kind.salt_len() + 8 + TAG_LEN);
        assert_eq!(
            decrypt_udp_packet(kind, &key, &packet).as_deref(),
            Some(b"datagram".as_ref())
        );

        let other = evp_bytes_to_key("wrong", kind.key_len());
        assert!(decrypt_udp_packet(kind, &other, &packet).is_none());
    }
}
