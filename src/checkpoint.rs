//! Pausable, byte-accounting stream wrappers
//!
//! A paused stream does not block its caller forever: each call waits at most
//! the pause backoff and then reports [`Step::Paused`], which moves no bytes
//! and is not an error. Only [`Step::EndOfStream`] or an error ends a copy.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::protocol::timeouts::PAUSE_BACKOFF_MS;
use crate::protocol::CHUNK_SIZE;
use crate::transfer::Transfer;

/// Outcome of one checkpointed read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Moved(usize),
    /// Transfer is paused; nothing was read or written.
    Paused,
    EndOfStream,
}

impl Step {
    pub fn bytes(&self) -> usize {
        match self {
            Step::Moved(n) => *n,
            Step::Paused | Step::EndOfStream => 0,
        }
    }
}

async fn backoff(transfer: &Transfer, delay: Duration) {
    // Resume wakes us early; otherwise the delay bounds the stall
    let _ = timeout(delay, transfer.wait_resumed()).await;
}

fn budget(transfer: &Transfer, len: usize) -> usize {
    usize::try_from(transfer.remaining()).map_or(len, |r| r.min(len))
}

pub struct CheckpointedReader<R> {
    inner: R,
    transfer: Arc<Transfer>,
    backoff: Duration,
}

impl<R: AsyncRead + Unpin> CheckpointedReader<R> {
    pub fn new(inner: R, transfer: Arc<Transfer>) -> Self {
        Self {
            inner,
            transfer,
            backoff: Duration::from_millis(PAUSE_BACKOFF_MS),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Read at most the transfer's remaining byte budget.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<Step> {
        if self.transfer.is_paused() {
            backoff(&self.transfer, self.backoff).await;
            return Ok(Step::Paused);
        }
        let cap = budget(&self.transfer, buf.len());
        if cap == 0 {
            return Ok(Step::EndOfStream);
        }
        let n = self.inner.read(&mut buf[..cap]).await?;
        if n == 0 {
            return Ok(Step::EndOfStream);
        }
        self.transfer.advance(n as u64);
        Ok(Step::Moved(n))
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        &self.transfer
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

pub struct CheckpointedWriter<W> {
    inner: W,
    transfer: Arc<Transfer>,
    backoff: Duration,
}

impl<W: AsyncWrite + Unpin> CheckpointedWriter<W> {
    pub fn new(inner: W, transfer: Arc<Transfer>) -> Self {
        Self {
            inner,
            transfer,
            backoff: Duration::from_millis(PAUSE_BACKOFF_MS),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Write part of `buf`. Writing past the declared size is an error.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<Step> {
        if self.transfer.is_paused() {
            backoff(&self.transfer, self.backoff).await;
            return Ok(Step::Paused);
        }
        if buf.len() as u64 > self.transfer.remaining() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write of {} bytes exceeds declared size of transfer {}",
                    buf.len(),
                    self.transfer.id
                ),
            ));
        }
        if buf.is_empty() {
            return Ok(Step::Moved(0));
        }
        let n = self.inner.write(buf).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.transfer.advance(n as u64);
        Ok(Step::Moved(n))
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    pub fn transfer(&self) -> &Arc<Transfer> {
        &self.transfer
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn short(transfer: &Transfer) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "transfer {}: moved {} of {} bytes",
            transfer.id,
            transfer.bytes_complete(),
            transfer.declared_size
        ),
    )
}

/// Copy the rest of a transfer from a checkpointed source into `out`.
pub async fn pump_from<R, W, F>(
    reader: &mut CheckpointedReader<R>,
    out: &mut W,
    mut on_progress: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        match reader.read(&mut buf).await? {
            Step::Moved(n) => {
                out.write_all(&buf[..n]).await?;
                copied += n as u64;
                on_progress(reader.transfer().bytes_complete());
            }
            Step::Paused => continue,
            Step::EndOfStream => break,
        }
    }
    out.flush().await?;
    if reader.transfer().remaining() > 0 {
        return Err(short(reader.transfer()));
    }
    Ok(copied)
}

/// Copy the rest of a transfer from `input` into a checkpointed sink.
pub async fn pump_into<R, W, F>(
    input: &mut R,
    writer: &mut CheckpointedWriter<W>,
    mut on_progress: F,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    while writer.transfer().remaining() > 0 {
        let want = budget(writer.transfer(), buf.len());
        let n = input.read(&mut buf[..want]).await?;
        if n == 0 {
            writer.flush().await?;
            return Err(short(writer.transfer()));
        }
        let mut off = 0;
        while off < n {
            match writer.write(&buf[off..n]).await? {
                Step::Moved(k) => off += k,
                Step::Paused => continue,
                Step::EndOfStream => return Err(io::ErrorKind::WriteZero.into()),
            }
        }
        copied += n as u64;
        on_progress(writer.transfer().bytes_complete());
    }
    writer.flush().await?;
    Ok(copied)
}

/// Read and drop `len` payload bytes so the next line parses as a frame.
pub async fn discard<R>(input: &mut R, len: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut limited = input.take(len);
    tokio::io::copy(&mut limited, &mut tokio::io::sink()).await
}
