//! VMess outbound leg (plain TCP or TLS+gRPC transport).

use async_trait::async_trait;
use rand::Rng as _;
use rand::RngCore as _;
use uuid::Uuid;

use crate::cipher_stream::CipherStream;
use crate::dialer::{BoxedStream, Dialer, Outbound};
use crate::metadata::Metadata;
use crate::vmess::aead::cmd_key;
use crate::vmess::codec::{CMD_TCP, RequestHeader, VmessCodec, VmessSecurity, options};
use crate::vmess::grpc;

#[derive(Debug, Clone)]
pub enum VmessTransport {
    Tcp,
    TlsGrpc { sni: String, service_name: String },
}

pub struct VmessOutbound {
    host: String,
    port: u16,
    cmd_key: [u8; 16],
    transport: VmessTransport,
    dialer: Dialer,
}

impl VmessOutbound {
    pub fn new(
        host: String,
        port: u16,
        password: &str,
        transport: VmessTransport,
        dialer: Dialer,
    ) -> anyhow::Result<Self> {
        let uuid: Uuid = password
            .parse()
            .map_err(|_| anyhow::anyhow!("vmess outbound password is not a uuid"))?;
        Ok(VmessOutbound {
            host,
            port,
            cmd_key: cmd_key(&uuid),
            transport,
            dialer,
        })
    }

    fn request_header(&self, target: &Metadata) -> RequestHeader {
        let mut rng = rand::thread_rng();
        let mut body_iv = [0u8; 16];
        let mut body_key = [0u8; 16];
        rng.fill_bytes(&mut body_iv);
        rng.fill_bytes(&mut body_key);
        RequestHeader {
            body_iv,
            body_key,
            resp_auth: rng.r#gen(),
            options: options::CHUNK_STREAM | options::CHUNK_MASKING,
            security: VmessSecurity::Aes128Gcm,
            cmd: CMD_TCP,
            target: target.clone(),
        }
    }
}

#[async_trait]
impl Outbound for VmessOutbound {
    async fn dial(&self, target: &Metadata) -> anyhow::Result<BoxedStream> {
        let header = self.request_header(target);
        let codec = VmessCodec::client(&self.cmd_key, &header);
        match &self.transport {
            VmessTransport::Tcp => {
                let stream = self.dialer.dial_tcp(&self.host, self.port).await?;
                Ok(Box::new(CipherStream::new(stream, codec)))
            }
            VmessTransport::TlsGrpc { sni, service_name } => {
                let stream = grpc::dial(&self.dialer, &self.host, self.port, sni, service_name).await?;
                Ok(Box::new(CipherStream::new(stream, codec)))
            }
        }
    }
}
