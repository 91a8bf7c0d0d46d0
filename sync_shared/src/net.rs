//! Stream framing for the socket transport.
//!
//! TCP carries a byte stream; each protocol frame is prefixed with its `u32`
//! little-endian length so whole frames come out the other side. The protocol
//! layer itself never sees the prefix.

use anyhow::{bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time,
};

use crate::bitstream::MAX_BYTES_LEN;

/// Largest frame accepted off the wire: kind byte, one maximal string, slack.
pub const MAX_FRAME_LEN: usize = MAX_BYTES_LEN + 64;

async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, frame: &[u8]) -> anyhow::Result<()> {
    if frame.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit", frame.len());
    }
    let mut buf = BytesMut::with_capacity(4 + frame.len());
    buf.put_u32_le(frame.len() as u32);
    buf.extend_from_slice(frame);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> anyhow::Result<Bytes> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("announced frame of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await.context("tcp read payload")?;
    Ok(Bytes::from(payload))
}

/// A framed TCP connection.
#[derive(Debug)]
pub struct FramedConn {
    stream: TcpStream,
}

impl FramedConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("tcp connect {addr}"))?;
        stream.set_nodelay(true).context("set nodelay")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.stream, frame).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<Bytes> {
        read_frame(&mut self.stream).await
    }

    /// Receives a frame within the given timeout.
    pub async fn recv_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<Bytes>> {
        match time::timeout(timeout, self.recv()).await {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (r, w) = self.stream.into_split();
        (FrameReader { half: r }, FrameWriter { half: w })
    }
}

/// Read half of a [`FramedConn`].
#[derive(Debug)]
pub struct FrameReader {
    half: OwnedReadHalf,
}

impl FrameReader {
    pub async fn recv(&mut self) -> anyhow::Result<Bytes> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a [`FramedConn`].
#[derive(Debug)]
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.half, frame).await
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.half.shutdown().await.context("tcp shutdown")
    }
}
