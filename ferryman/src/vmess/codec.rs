//! VMess AEAD request/response headers and body chunking.

use std::io;

use rand::Rng as _;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};
use sha3::digest::{ExtendableOutput as _, Update as _, XofReader as _};
use sha3::{Shake128, Shake128Reader};

use crate::ProxyError;
use crate::cipher_stream::{Chunk, ChunkCodec, ReadInit};
use crate::crypto::{AeadCipher, CipherKind, TAG_LEN};
use crate::metadata::{ADDR_TYPE_DOMAIN, ADDR_TYPE_IPV4, ADDR_TYPE_IPV6, ADDR_TYPE_MSG, Metadata, MetadataCmd};
use crate::vmess::aead::{
    KDF_SALT_HEADER_IV, KDF_SALT_HEADER_KEY, KDF_SALT_HEADER_LEN_IV, KDF_SALT_HEADER_LEN_KEY, KDF_SALT_RESP_IV,
    KDF_SALT_RESP_KEY, KDF_SALT_RESP_LEN_IV, KDF_SALT_RESP_LEN_KEY, chacha_body_key, fnv1a32, kdf12, kdf16,
    seal_auth_id,
};

pub mod options {
    pub const CHUNK_STREAM: u8 = 0x01;
    pub const CHUNK_MASKING: u8 = 0x04;
    pub const GLOBAL_PADDING: u8 = 0x08;
}

pub const SECURITY_AES_128_GCM: u8 = 3;
pub const SECURITY_CHACHA20_POLY1305: u8 = 4;

pub const CMD_TCP: u8 = 1;
pub const CMD_UDP: u8 = 2;

const MAX_WRITE_CHUNK: usize = 8 * 1024;
const MAX_PADDING: u16 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmessSecurity {
    Aes128Gcm,
    ChaCha20Poly1305,
}

impl VmessSecurity {
    pub fn from_byte(b: u8) -> Result<Self, ProxyError> {
        match b {
            SECURITY_AES_128_GCM => Ok(VmessSecurity::Aes128Gcm),
            SECURITY_CHACHA20_POLY1305 => Ok(VmessSecurity::ChaCha20Poly1305),
            _ => Err(ProxyError::InvalidMetadata),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            VmessSecurity::Aes128Gcm => SECURITY_AES_128_GCM,
            VmessSecurity::ChaCha20Poly1305 => SECURITY_CHACHA20_POLY1305,
        }
    }

    fn body_cipher(self, key: &[u8; 16]) -> AeadCipher {
        match self {
            VmessSecurity::Aes128Gcm => CipherKind::Aes128Gcm.new_cipher(key),
            VmessSecurity::ChaCha20Poly1305 => {
                CipherKind::ChaCha20IetfPoly1305.new_cipher(&chacha_body_key(key))
            }
        }
    }
}

/// The decoded 41+-byte instruction.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub body_iv: [u8; 16],
    pub body_key: [u8; 16],
    pub resp_auth: u8,
    pub options: u8,
    pub security: VmessSecurity,
    pub cmd: u8,
    pub target: Metadata,
}

impl RequestHeader {
    pub fn has_option(&self, option: u8) -> bool {
        self.options & option != 0
    }

    pub fn response_keys(&self) -> ([u8; 16], [u8; 16]) {
        let key: [u8; 16] = Sha256::digest(self.body_key)[..16].try_into().expect("digest length");
        let iv: [u8; 16] = Sha256::digest(self.body_iv)[..16].try_into().expect("digest length");
        (key, iv)
    }

    pub fn encode_instruction(&self, padding_len: u8) -> Vec<u8> {
        debug_assert!(padding_len < 16);
        let mut out = Vec::with_capacity(64);
        out.push(1); // version
        out.extend_from_slice(&self.body_iv);
        out.extend_from_slice(&self.body_key);
        out.push(self.resp_auth);
        out.push(self.options);
        out.push((padding_len << 4) | self.security.to_byte());
        out.push(0); // reserved
        out.push(self.cmd);
        match &self.target {
            Metadata::Ipv4 { addr, port } => {
                out.extend_from_slice(&port.to_be_bytes());
                out.push(ADDR_TYPE_IPV4);
                out.extend_from_slice(&addr.octets());
            }
            Metadata::Ipv6 { addr, port } => {
                out.extend_from_slice(&port.to_be_bytes());
                out.push(ADDR_TYPE_IPV6);
                out.extend_from_slice(&addr.octets());
            }
            Metadata::Domain { host, port } => {
                out.extend_from_slice(&port.to_be_bytes());
                out.push(ADDR_TYPE_DOMAIN);
                out.push(host.len() as u8);
                out.extend_from_slice(host.as_bytes());
            }
            Metadata::Msg { cmd, .. } => {
                out.extend_from_slice(&0u16.to_be_bytes());
                out.push(ADDR_TYPE_MSG);
                out.push(cmd.to_byte());
            }
        }
        let mut padding = vec![0u8; padding_len as usize];
        rand::thread_rng().fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
        out.extend_from_slice(&fnv1a32(&out).to_be_bytes());
        out
    }

    pub fn decode_instruction(data: &[u8]) -> Result<Self, ProxyError> {
        if data.len() < 45 {
            return Err(ProxyError::InvalidMetadata);
        }
        let checksum_offset = data.len() - 4;
        let expected = u32::from_be_bytes(data[checksum_offset..].try_into().expect("sized above"));
        if fnv1a32(&data[..checksum_offset]) != expected {
            return Err(ProxyError::InvalidMetadata);
        }
        if data[0] != 1 {
            return Err(ProxyError::InvalidMetadata);
        }
        let body_iv: [u8; 16] = data[1..17].try_into().expect("sized above");
        let body_key: [u8; 16] = data[17..33].try_into().expect("sized above");
        let resp_auth = data[33];
        let opts = data[34];
        let security = VmessSecurity::from_byte(data[35] & 0x0F)?;
        let cmd = data[37];
        let port = u16::from_be_bytes([data[38], data[39]]);
        let addr_type = data[40];
        let addr = &data[41..checksum_offset];
        let target = match addr_type {
            ADDR_TYPE_IPV4 if addr.len() >= 4 => Metadata::Ipv4 {
                addr: <[u8; 4]>::try_from(&addr[..4]).expect("sized above").into(),
                port,
            },
            ADDR_TYPE_IPV6 if addr.len() >= 16 => Metadata::Ipv6 {
                addr: <[u8; 16]>::try_from(&addr[..16]).expect("sized above").into(),
                port,
            },
            ADDR_TYPE_DOMAIN if !addr.is_empty() => {
                let len = addr[0] as usize;
                if len == 0 || addr.len() < 1 + len {
                    return Err(ProxyError::InvalidMetadata);
                }
                Metadata::Domain {
                    host: std::str::from_utf8(&addr[1..1 + len])
                        .map_err(|_| ProxyError::InvalidMetadata)?
                        .to_owned(),
                    port,
                }
            }
            ADDR_TYPE_MSG if !addr.is_empty() => Metadata::Msg {
                cmd: MetadataCmd::from_byte(addr[0]).ok_or(ProxyError::InvalidMetadata)?,
                // The body length travels as a prefix of the body stream.
                len_body: 0,
            },
            _ => return Err(ProxyError::InvalidMetadata),
        };
        Ok(RequestHeader {
            body_iv,
            body_key,
            resp_auth,
            options: opts,
            security,
            cmd,
            target,
        })
    }
}

/// One body direction: AEAD instance plus nonce/mask/padding generators.
struct ChunkState {
    cipher: AeadCipher,
    iv: [u8; 16],
    count: u16,
    shake: Option<Shake128Reader>,
    global_padding: bool,
}

impl ChunkState {
    fn new(security: VmessSecurity, key: &[u8; 16], iv: [u8; 16], opts: u8) -> Self {
        let shake = (opts & options::CHUNK_MASKING != 0).then(|| {
            let mut hasher = Shake128::default();
            hasher.update(&iv);
            hasher.finalize_xof()
        });
        ChunkState {
            cipher: security.body_cipher(key),
            iv,
            count: 0,
            shake,
            global_padding: opts & options::CHUNK_MASKING != 0 && opts & options::GLOBAL_PADDING != 0,
        }
    }

    fn nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..2].copy_from_slice(&self.count.to_be_bytes());
        nonce[2..].copy_from_slice(&self.iv[2..12]);
        nonce
    }

    fn shake_u16(&mut self) -> u16 {
        let reader = self.shake.as_mut().expect("masking enabled");
        let mut pair = [0u8; 2];
        reader.read(&mut pair);
        u16::from_be_bytes(pair)
    }

    /// Shake consumption order is padding first, then size mask.
    fn next_padding(&mut self) -> u16 {
        if self.global_padding { self.shake_u16() % MAX_PADDING } else { 0 }
    }

    fn encode_size(&mut self, size: u16) -> [u8; 2] {
        match self.shake.is_some() {
            true => (size ^ self.shake_u16()).to_be_bytes(),
            false => size.to_be_bytes(),
        }
    }

    fn decode_size(&mut self, block: &[u8]) -> u16 {
        let raw = u16::from_be_bytes([block[0], block[1]]);
        match self.shake.is_some() {
            true => raw ^ self.shake_u16(),
            false => raw,
        }
    }

    fn seal_chunk(&mut self, payload: &[u8]) -> Vec<u8> {
        let padding = self.next_padding();
        let sealed = self.cipher.seal(&self.nonce(), payload, &[]);
        self.count = self.count.wrapping_add(1);
        let size = (sealed.len() + padding as usize) as u16;
        let mut out = Vec::with_capacity(2 + size as usize);
        out.extend_from_slice(&self.encode_size(size));
        out.extend_from_slice(&sealed);
        let mut pad = vec![0u8; padding as usize];
        rand::thread_rng().fill_bytes(&mut pad);
        out.extend_from_slice(&pad);
        out
    }
}

enum ReadRole {
    /// Server: body chunks immediately (the header was consumed during the
    /// handshake).
    Ready,
    /// Client: response length block, then the response header.
    ClientRespLen,
    ClientRespHeader { len: usize },
}

/// Body codec for one VMess connection, either side.
pub struct VmessCodec {
    security: VmessSecurity,
    opts: u8,
    read_key: [u8; 16],
    read_iv: [u8; 16],
    write_key: [u8; 16],
    write_iv: [u8; 16],
    resp_auth: u8,
    read_role: ReadRole,
    read: Option<ChunkState>,
    write: Option<ChunkState>,
    /// Prefix bytes to emit before the first chunk.
    prefix: Vec<u8>,
    pending_padding: u16,
}

impl VmessCodec {
    /// Server side: read with the request keys, respond with the derived
    /// response keys behind the encrypted response header.
    pub fn server(header: &RequestHeader) -> Self {
        let (resp_key, resp_iv) = header.response_keys();
        let prefix = seal_response_header(&resp_key, &resp_iv, header.resp_auth);
        VmessCodec {
            security: header.security,
            opts: header.options,
            read_key: header.body_key,
            read_iv: header.body_iv,
            write_key: resp_key,
            write_iv: resp_iv,
            resp_auth: header.resp_auth,
            read_role: ReadRole::Ready,
            read: None,
            write: None,
            prefix,
            pending_padding: 0,
        }
    }

    /// Client side: `prefix` is the full sealed request (auth ID, length
    /// block, connection nonce, instruction).
    pub fn client(cmd_key: &[u8; 16], header: &RequestHeader) -> Self {
        let (resp_key, resp_iv) = header.response_keys();
        let prefix = seal_request(cmd_key, header);
        VmessCodec {
            security: header.security,
            opts: header.options,
            read_key: resp_key,
            read_iv: resp_iv,
            write_key: header.body_key,
            write_iv: header.body_iv,
            resp_auth: header.resp_auth,
            read_role: ReadRole::ClientRespLen,
            read: None,
            write: None,
            prefix,
            pending_padding: 0,
        }
    }

    fn read_state(&mut self) -> &mut ChunkState {
        if self.read.is_none() {
            self.read = Some(ChunkState::new(self.security, &self.read_key, self.read_iv, self.opts));
        }
        self.read.as_mut().expect("initialized above")
    }
}

impl ChunkCodec for VmessCodec {
    fn read_init(&self) -> ReadInit {
        match self.read_role {
            ReadRole::Ready => ReadInit::Ready,
            ReadRole::ClientRespLen => ReadInit::Need(2 + TAG_LEN),
            ReadRole::ClientRespHeader { len } => ReadInit::Need(len + TAG_LEN),
        }
    }

    fn read_init_feed(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.read_role {
            ReadRole::Ready => Ok(()),
            ReadRole::ClientRespLen => {
                let key = kdf16(&self.read_key, &[KDF_SALT_RESP_LEN_KEY]);
                let iv = kdf12(&self.read_iv, &[KDF_SALT_RESP_LEN_IV]);
                let opened = CipherKind::Aes128Gcm
                    .new_cipher(&key)
                    .open(&iv, bytes, &[])
                    .ok_or_else(|| io::Error::other(ProxyError::FailAuth))?;
                let len = usize::from(u16::from_be_bytes([opened[0], opened[1]]));
                self.read_role = ReadRole::ClientRespHeader { len };
                Ok(())
            }
            ReadRole::ClientRespHeader { .. } => {
                let key = kdf16(&self.read_key, &[KDF_SALT_RESP_KEY]);
                let iv = kdf12(&self.read_iv, &[KDF_SALT_RESP_IV]);
                let opened = CipherKind::Aes128Gcm
                    .new_cipher(&key)
                    .open(&iv, bytes, &[])
                    .ok_or_else(|| io::Error::other(ProxyError::FailAuth))?;
                if opened.first() != Some(&self.resp_auth) {
                    return Err(io::Error::other(ProxyError::FailAuth));
                }
                self.read_role = ReadRole::Ready;
                Ok(())
            }
        }
    }

    fn len_block_size(&self) -> usize {
        2
    }

    fn decode_len(&mut self, block: &[u8]) -> io::Result<usize> {
        let state = self.read_state();
        let padding = state.next_padding();
        let size = state.decode_size(block);
        self.pending_padding = padding;
        if usize::from(size) < TAG_LEN + usize::from(padding) {
            return Err(io::Error::other(ProxyError::InvalidMetadata));
        }
        Ok(usize::from(size))
    }

    fn open_chunk(&mut self, block: &[u8]) -> io::Result<Chunk> {
        let padding = usize::from(self.pending_padding);
        let state = self.read.as_mut().expect("read state initialized");
        let sealed = &block[..block.len() - padding];
        let payload = state
            .cipher
            .open(&state.nonce(), sealed, &[])
            .ok_or_else(|| io::Error::other(ProxyError::FailAuth))?;
        state.count = state.count.wrapping_add(1);
        match payload.is_empty() {
            // Empty sealed payload is the in-band terminal signal.
            true => Ok(Chunk::Terminal),
            false => Ok(Chunk::Data(payload)),
        }
    }

    fn write_prefix(&mut self) -> io::Result<Vec<u8>> {
        self.write = Some(ChunkState::new(self.security, &self.write_key, self.write_iv, self.opts));
        Ok(std::mem::take(&mut self.prefix))
    }

    fn max_payload(&self) -> usize {
        MAX_WRITE_CHUNK
    }

    fn seal_chunk(&mut self, payload: &[u8]) -> Vec<u8> {
        self.write.as_mut().expect("prefix written first").seal_chunk(payload)
    }

    fn seal_terminal(&mut self) -> Option<Vec<u8>> {
        Some(self.write.as_mut().expect("prefix written first").seal_chunk(&[]))
    }
}

/// Server → client response header: sealed length, then `[resp_auth, 0, 0, 0]`.
fn seal_response_header(resp_key: &[u8; 16], resp_iv: &[u8; 16], resp_auth: u8) -> Vec<u8> {
    let header = [resp_auth, 0, 0, 0];

    let len_key = kdf16(resp_key, &[KDF_SALT_RESP_LEN_KEY]);
    let len_iv = kdf12(resp_iv, &[KDF_SALT_RESP_LEN_IV]);
    let mut out = CipherKind::Aes128Gcm
        .new_cipher(&len_key)
        .seal(&len_iv, &(header.len() as u16).to_be_bytes(), &[]);

    let key = kdf16(resp_key, &[KDF_SALT_RESP_KEY]);
    let iv = kdf12(resp_iv, &[KDF_SALT_RESP_IV]);
    out.extend_from_slice(&CipherKind::Aes128Gcm.new_cipher(&key).seal(&iv, &header, &[]));
    out
}

/// Client → server request envelope.
pub fn seal_request(cmd_key: &[u8; 16], header: &RequestHeader) -> Vec<u8> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs() as i64;
    let mut rng = rand::thread_rng();
    let eauth = seal_auth_id(cmd_key, now, rng.r#gen());

    let mut nonce = [0u8; 8];
    rng.fill_bytes(&mut nonce);

    let instruction = header.encode_instruction(rng.gen_range(0..16));

    let len_key = kdf16(cmd_key, &[KDF_SALT_HEADER_LEN_KEY, &eauth, &nonce]);
    let len_iv = kdf12(cmd_key, &[KDF_SALT_HEADER_LEN_IV, &eauth, &nonce]);
    let sealed_len = CipherKind::Aes128Gcm
        .new_cipher(&len_key)
        .seal(&len_iv, &(instruction.len() as u16).to_be_bytes(), &eauth);

    let key = kdf16(cmd_key, &[KDF_SALT_HEADER_KEY, &eauth, &nonce]);
    let iv = kdf12(cmd_key, &[KDF_SALT_HEADER_IV, &eauth, &nonce]);
    let sealed_instruction = CipherKind::Aes128Gcm.new_cipher(&key).seal(&iv, &instruction, &eauth);

    let mut out = Vec::with_capacity(16 + sealed_len.len() + 8 + sealed_instruction.len());
    out.extend_from_slice(&eauth);
    out.extend_from_slice(&sealed_len);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed_instruction);
    out
}

/// Server side of the envelope: open the sealed instruction length.
pub fn open_request_len(cmd_key: &[u8; 16], eauth: &[u8; 16], nonce: &[u8; 8], block: &[u8]) -> Option<u16> {
    let key = kdf16(cmd_key, &[KDF_SALT_HEADER_LEN_KEY, eauth, nonce]);
    let iv = kdf12(cmd_key, &[KDF_SALT_HEADER_LEN_IV, eauth, nonce]);
    let opened = CipherKind::Aes128Gcm.new_cipher(&key).open(&iv, block, eauth)?;
    Some(u16::from_be_bytes([opened[0], opened[1]]))
}

/// Server side of the envelope: open the sealed instruction itself.
pub fn open_request_instruction(
    cmd_key: &[u8; 16],
    eauth: &[u8; 16],
    nonce: &[u8; 8],
    block: &[u8],
) -> Option<Vec<u8>> {
    let key = kdf16(cmd_key, &[KDF_SALT_HEADER_KEY, eauth, nonce]);
    let iv = kdf12(cmd_key, &[KDF_SALT_HEADER_IV, eauth, nonce]);
    CipherKind::Aes128Gcm.new_cipher(&key).open(&iv, block, eauth)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn header(security: VmessSecurity, opts: u8) -> RequestHeader {
        let mut rng = rand::thread_rng();
        let mut body_iv = [0u8; 16];
        let mut body_key = [0u8; 16];
        rng.fill_bytes(&mut body_iv);
        rng.fill_bytes(&mut body_key);
        RequestHeader {
            body_iv,
            body_key,
            resp_auth: rng.r#gen(),
            options: opts,
            security,
            cmd: CMD_TCP,
            target: Metadata::Domain {
                host: "example.com".to_owned(),
                port: 443,
            },
        }
    }

    #[test]
    fn instruction_round_trip() {
        let original = header(VmessSecurity::Aes128Gcm, options::CHUNK_STREAM | options::CHUNK_MASKING);
        let encoded = original.encode_instruction(7);
        let decoded = RequestHeader::decode_instruction(&encoded).expect("valid instruction");
        assert_eq!(decoded.body_iv, original.body_iv);
        assert_eq!(decoded.body_key, original.body_key);
        assert_eq!(decoded.resp_auth, original.resp_auth);
        assert_eq!(decoded.options, original.options);
        assert_eq!(decoded.security, original.security);
        assert_eq!(decoded.cmd, original.cmd);
        assert_eq!(decoded.target, original.target);
    }

    #[test]
    fn instruction_checksum_is_verified() {
        let original = header(VmessSecurity::Aes128Gcm, options::CHUNK_STREAM);
        let mut encoded = original.encode_instruction(0);
        let last = encoded.len() - 1;
        encoded[last] ^= 1;
        assert!(matches!(
            RequestHeader::decode_instruction(&encoded),
            Err(ProxyError::InvalidMetadata)
        ));
    }

    #[test]
    fn request_envelope_round_trip() {
        let cmd_key = [9u8; 16];
        let original = header(VmessSecurity::ChaCha20Poly1305, options::CHUNK_STREAM);
        let wire = seal_request(&cmd_key, &original);

        let eauth: [u8; 16] = wire[..16].try_into().expect("prefix");
        let sealed_len = &wire[16..34];
        let nonce: [u8; 8] = wire[34..42].try_into().expect("nonce");
        let len = open_request_len(&cmd_key, &eauth, &nonce, sealed_len).expect("length opens");
        let instruction =
            open_request_instruction(&cmd_key, &eauth, &nonce, &wire[42..42 + usize::from(len) + TAG_LEN])
                .expect("instruction opens");
        let decoded = RequestHeader::decode_instruction(&instruction).expect("valid instruction");
        assert_eq!(decoded.target, original.target);
    }

    #[rstest]
    #[case(VmessSecurity::Aes128Gcm, options::CHUNK_STREAM)]
    #[case(VmessSecurity::Aes128Gcm, options::CHUNK_STREAM | options::CHUNK_MASKING)]
    #[case(
        VmessSecurity::Aes128Gcm,
        options::CHUNK_STREAM | options::CHUNK_MASKING | options::GLOBAL_PADDING
    )]
    #[case(VmessSecurity::ChaCha20Poly1305, options::CHUNK_STREAM | options::CHUNK_MASKING)]
    fn body_chunks_round_trip(#[case] security: VmessSecurity, #[case] opts: u8) {
        let request = header(security, opts);

        // Writer: the server's response direction.
        let mut server = VmessCodec::server(&request);
        let _prefix = server.write_prefix().expect("prefix");
        let mut wire = Vec::new();
        for part in [b"hello ".as_ref(), b"world".as_ref()] {
            wire.extend_from_slice(&server.seal_chunk(part));
        }
        wire.extend_from_slice(&server.seal_terminal().expect("terminal"));

        // Reader: a client's read direction over the same derived keys.
        let (resp_key, resp_iv) = request.response_keys();
        let mut reader = ChunkState::new(security, &resp_key, resp_iv, opts);
        let mut offset = 0;
        let mut received = Vec::new();
        loop {
            let padding = usize::from(reader.next_padding());
            let size = usize::from(reader.decode_size(&wire[offset..offset + 2]));
            offset += 2;
            let sealed = &wire[offset..offset + size - padding];
            offset += size;
            let payload = reader.cipher.open(&reader.nonce(), sealed, &[]).expect("chunk opens");
            reader.count = reader.count.wrapping_add(1);
            if payload.is_empty() {
                break;
            }
            received.extend_from_slice(&payload);
        }
        assert_eq!(received, b"hello world");
        assert_eq!(offset, wire.len());
    }
}
