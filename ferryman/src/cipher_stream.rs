//! Generic AEAD-framed stream plumbing.
//!
//! Shadowsocks and VMess both frame a byte stream into sealed chunks behind
//! a one-off prefix (salt or header). The poll-level state machine lives
//! here once; the protocols supply a [`ChunkCodec`] describing their exact
//! framing. The resulting [`CipherStream`] is a plain `AsyncRead +
//! AsyncWrite`, so the relay treats it like any other socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf as _, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::pool::{self, PooledBuf};

/// What the codec wants next while setting up the read side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadInit {
    /// Feed exactly this many more bytes.
    Need(usize),
    Ready,
}

/// One chunk, decoded.
pub enum Chunk {
    Data(Vec<u8>),
    /// In-band terminal signal (VMess empty chunk). Clean EOF.
    Terminal,
}

/// Protocol-specific framing rules. All methods are synchronous and operate
/// on complete byte blocks; the stream machinery does the I/O.
pub trait ChunkCodec: Send {
    // -- read side --

    fn read_init(&self) -> ReadInit;

    /// Feed the bytes previously requested through [`ReadInit::Need`].
    fn read_init_feed(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Size of the length block that precedes every chunk.
    fn len_block_size(&self) -> usize;

    /// Decode a length block; returns how many bytes follow it.
    fn decode_len(&mut self, block: &[u8]) -> io::Result<usize>;

    /// Open the block that follows the length block.
    fn open_chunk(&mut self, block: &[u8]) -> io::Result<Chunk>;

    // -- write side --

    /// One-off bytes preceding the first chunk (salt, encrypted header).
    fn write_prefix(&mut self) -> io::Result<Vec<u8>>;

    /// Largest plaintext chunk the framing can carry.
    fn max_payload(&self) -> usize;

    /// Seal one chunk, length block included.
    fn seal_chunk(&mut self, payload: &[u8]) -> Vec<u8>;

    /// Terminal marker emitted at shutdown, when the protocol has one.
    fn seal_terminal(&mut self) -> Option<Vec<u8>>;
}

enum ReadPhase {
    Init,
    LenBlock,
    Body { expect: usize },
    Emit { chunk: Vec<u8>, offset: usize },
    Eof,
}

enum WritePhase {
    Prefix,
    Streaming,
    Shutdown,
}

pub struct CipherStream<S, C> {
    inner: S,
    codec: C,
    // read side
    raw: BytesMut,
    scratch: PooledBuf,
    saw_eof: bool,
    read_phase: ReadPhase,
    // write side
    outgoing: BytesMut,
    write_phase: WritePhase,
}

impl<S, C> CipherStream<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: ChunkCodec,
{
    pub fn new(inner: S, codec: C) -> Self {
        CipherStream {
            inner,
            codec,
            raw: BytesMut::with_capacity(16 * 1024),
            scratch: pool::get(16 * 1024),
            saw_eof: false,
            read_phase: ReadPhase::Init,
            outgoing: BytesMut::new(),
            write_phase: WritePhase::Prefix,
        }
    }

    /// Seed the raw read buffer with bytes already consumed from the socket
    /// (auth probing peeks ahead of the stream).
    pub fn preread(mut self, bytes: &[u8]) -> Self {
        self.raw.extend_from_slice(bytes);
        self
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn codec_mut(&mut self) -> &mut C {
        &mut self.codec
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Pull raw bytes until at least `n` are buffered.
    fn poll_fill(&mut self, cx: &mut Context<'_>, n: usize) -> Poll<io::Result<()>> {
        while self.raw.len() < n {
            if self.saw_eof {
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            let mut buf = ReadBuf::new(&mut self.scratch);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
            if buf.filled().is_empty() {
                self.saw_eof = true;
            } else {
                let filled = buf.filled().len();
                let chunk = &self.scratch[..filled];
                self.raw.extend_from_slice(chunk);
            }
        }
        Poll::Ready(Ok(()))
    }

    fn take_raw(&mut self, n: usize) -> Vec<u8> {
        let bytes = self.raw[..n].to_vec();
        self.raw.advance(n);
        bytes
    }

    fn poll_flush_outgoing(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.outgoing.is_empty() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.outgoing))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.outgoing.advance(written);
        }
        Poll::Ready(Ok(()))
    }

    fn ensure_prefix(&mut self) -> io::Result<()> {
        if matches!(self.write_phase, WritePhase::Prefix) {
            let prefix = self.codec.write_prefix()?;
            self.outgoing.extend_from_slice(&prefix);
            self.write_phase = WritePhase::Streaming;
        }
        Ok(())
    }
}

impl<S, C> AsyncRead for CipherStream<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: ChunkCodec + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.read_phase {
                ReadPhase::Init => match this.codec.read_init() {
                    ReadInit::Ready => this.read_phase = ReadPhase::LenBlock,
                    ReadInit::Need(n) => {
                        ready!(this.poll_fill(cx, n))?;
                        let bytes = this.take_raw(n);
                        this.codec.read_init_feed(&bytes)?;
                    }
                },
                ReadPhase::LenBlock => {
                    let n = this.codec.len_block_size();
                    // EOF exactly on a chunk boundary is a clean close.
                    if this.raw.is_empty() && this.saw_eof {
                        this.read_phase = ReadPhase::Eof;
                        continue;
                    }
                    match this.poll_fill(cx, n) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e))
                            if e.kind() == io::ErrorKind::UnexpectedEof && this.raw.is_empty() =>
                        {
                            this.read_phase = ReadPhase::Eof;
                            continue;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    let block = this.take_raw(n);
                    let expect = this.codec.decode_len(&block)?;
                    this.read_phase = ReadPhase::Body { expect };
                }
                ReadPhase::Body { expect } => {
                    let expect = *expect;
                    ready!(this.poll_fill(cx, expect))?;
                    let block = this.take_raw(expect);
                    match this.codec.open_chunk(&block)? {
                        Chunk::Data(chunk) if chunk.is_empty() => this.read_phase = ReadPhase::LenBlock,
                        Chunk::Data(chunk) => this.read_phase = ReadPhase::Emit { chunk, offset: 0 },
                        Chunk::Terminal => this.read_phase = ReadPhase::Eof,
                    }
                }
                ReadPhase::Emit { chunk, offset } => {
                    let n = (chunk.len() - *offset).min(out.remaining());
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    out.put_slice(&chunk[*offset..*offset + n]);
                    *offset += n;
                    if *offset == chunk.len() {
                        this.read_phase = ReadPhase::LenBlock;
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadPhase::Eof => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<S, C> AsyncWrite for CipherStream<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: ChunkCodec + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // Finish what is already sealed before accepting more plaintext, so
        // the outgoing buffer stays bounded by one chunk.
        ready!(this.poll_flush_outgoing(cx))?;
        this.ensure_prefix()?;

        let n = data.len().min(this.codec.max_payload());
        let sealed = this.codec.seal_chunk(&data[..n]);
        this.outgoing.extend_from_slice(&sealed);
        // Opportunistic flush; the bytes are already committed.
        let _ = this.poll_flush_outgoing(cx)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_outgoing(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !matches!(this.write_phase, WritePhase::Shutdown) {
            this.ensure_prefix()?;
            if let Some(terminal) = this.codec.seal_terminal() {
                this.outgoing.extend_from_slice(&terminal);
            }
            this.write_phase = WritePhase::Shutdown;
        }
        ready!(this.poll_flush_outgoing(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
