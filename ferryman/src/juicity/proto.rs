//! Juicity wire pieces: the TUIC-style authenticate command, per-stream
//! Trojan-C metadata and the UDP-over-TCP datagram framing.

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use uuid::Uuid;

use crate::ProxyError;
use crate::metadata::{Metadata, read_metadata};

pub const VERSION: u8 = 0;
pub const CMD_AUTHENTICATE: u8 = 0x00;

pub const STREAM_CMD_CONNECT: u8 = 1;
pub const STREAM_CMD_PACKET: u8 = 3;

pub const TOKEN_LEN: usize = 32;
pub const EXPORTER_LABEL: &[u8] = b"EXPORTER-TUIC-AUTH";

/// `[ver][cmd][uuid:16][token:32]` on a unidirectional stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    pub uuid: Uuid,
    pub token: [u8; TOKEN_LEN],
}

impl Authenticate {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 16 + TOKEN_LEN);
        out.push(VERSION);
        out.push(CMD_AUTHENTICATE);
        out.extend_from_slice(self.uuid.as_bytes());
        out.extend_from_slice(&self.token);
        out
    }

    pub async fn read_from<S>(stream: &mut S) -> anyhow::Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let version = stream.read_u8().await?;
        if version != VERSION {
            return Err(anyhow::anyhow!("unexpected version: {version}"));
        }
        let cmd = stream.read_u8().await?;
        if cmd != CMD_AUTHENTICATE {
            return Err(anyhow::anyhow!("unexpected command type: {cmd}"));
        }
        let mut uuid = [0u8; 16];
        stream.read_exact(&mut uuid).await?;
        let mut token = [0u8; TOKEN_LEN];
        stream.read_exact(&mut token).await?;
        Ok(Authenticate {
            uuid: Uuid::from_bytes(uuid),
            token,
        })
    }
}

/// Trojan-C stream header: `[cmd][metadata][\r\n]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub cmd: u8,
    pub target: Metadata,
}

impl StreamHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.cmd];
        out.extend_from_slice(&self.target.encode());
        out.extend_from_slice(b"\r\n");
        out
    }

    pub async fn read_from<S>(stream: &mut S) -> anyhow::Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let cmd = stream.read_u8().await?;
        if cmd != STREAM_CMD_CONNECT && cmd != STREAM_CMD_PACKET {
            return Err(ProxyError::InvalidMetadata.into());
        }
        let target = read_metadata(stream).await?;
        let mut crlf = [0u8; 2];
        stream.read_exact(&mut crlf).await?;
        if crlf != *b"\r\n" {
            return Err(ProxyError::InvalidMetadata.into());
        }
        Ok(StreamHeader { cmd, target })
    }
}

/// One UDP-over-TCP datagram: `[metadata][len u16 BE][payload]`.
pub async fn write_datagram<S>(stream: &mut S, from: &Metadata, payload: &[u8]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = from.encode();
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// Returns `None` on clean EOF before a new frame starts.
pub async fn read_datagram<S>(stream: &mut S) -> anyhow::Result<Option<(Metadata, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 1];
    match stream.read(&mut head).await? {
        0 => return Ok(None),
        _ => {}
    }
    let mut second = [0u8; 1];
    stream.read_exact(&mut second).await?;
    let size = Metadata::wire_size(&[head[0], second[0]])?;
    let mut buf = vec![0u8; size];
    buf[0] = head[0];
    buf[1] = second[0];
    stream.read_exact(&mut buf[2..]).await?;
    let metadata = Metadata::decode(&buf)?;
    let len = stream.read_u16().await?;
    let mut payload = vec![0u8; usize::from(len)];
    stream.read_exact(&mut payload).await?;
    Ok(Some((metadata, payload)))
}
