//! Shadowsocks outbound leg: the node re-encodes accepted traffic toward an
//! upstream relay.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;

use crate::cipher_stream::CipherStream;
use crate::crypto::{CipherKind, evp_bytes_to_key};
use crate::dialer::{BoxedStream, Dialer, Outbound};
use crate::metadata::Metadata;

pub struct SsOutbound {
    host: String,
    port: u16,
    kind: CipherKind,
    master_key: Vec<u8>,
    dialer: Dialer,
}

impl SsOutbound {
    pub fn new(host: String, port: u16, method: &str, password: &str, dialer: Dialer) -> anyhow::Result<Self> {
        let kind = CipherKind::from_method(method)
            .ok_or_else(|| anyhow::anyhow!("unsupported cipher method {method:?}"))?;
        Ok(SsOutbound {
            host,
            port,
            kind,
            master_key: evp_bytes_to_key(password, kind.key_len()),
            dialer,
        })
    }
}

#[async_trait]
impl Outbound for SsOutbound {
    async fn dial(&self, target: &Metadata) -> anyhow::Result<BoxedStream> {
        let stream = self.dialer.dial_tcp(&self.host, self.port).await?;
        let codec = super::SsCodec::client(self.kind, self.master_key.clone());
        let mut stream = CipherStream::new(stream, codec);
        stream.write_all(&target.encode()).await?;
        Ok(Box::new(stream))
    }
}
