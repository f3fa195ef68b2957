//! Application stream bridging async byte I/O (stdin/stdout, sockets,
//! in-process duplex pipes) to the non-blocking [`AppStream`] interface.
//!
//! A reader task fills a bounded queue from the `AsyncRead`; a writer task
//! drains a bounded queue into the `AsyncWrite`. Both signal the shared
//! `Notify` whenever the connection may be able to make progress.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{RelStreamError, Result};
use crate::packet::MAX_PAYLOAD;
use crate::transport::{AppStream, ReadOutcome};

/// Queue depth in each direction, in chunks of up to [`MAX_PAYLOAD`] bytes.
pub const PIPE_SLOTS: usize = 64;

pub struct PipeStream {
    input: mpsc::Receiver<Bytes>,
    pending: Bytes,
    output: Option<mpsc::Sender<Bytes>>,
}

impl PipeStream {
    /// Spawn the reader and writer tasks. Must be called inside a tokio
    /// runtime. The returned handle completes once everything written to
    /// the stream has been flushed and the writer shut down.
    pub fn spawn<R, W>(reader: R, writer: W, readiness: Arc<Notify>) -> (Self, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (in_tx, in_rx) = mpsc::channel(PIPE_SLOTS);
        let (out_tx, out_rx) = mpsc::channel(PIPE_SLOTS);
        tokio::spawn(read_task(reader, in_tx, readiness.clone()));
        let flushed = tokio::spawn(write_task(writer, out_rx, readiness));
        let stream = Self {
            input: in_rx,
            pending: Bytes::new(),
            output: Some(out_tx),
        };
        (stream, flushed)
    }

    /// Bridge the process's stdin and stdout.
    pub fn stdio(readiness: Arc<Notify>) -> (Self, JoinHandle<()>) {
        Self::spawn(tokio::io::stdin(), tokio::io::stdout(), readiness)
    }
}

impl AppStream for PipeStream {
    fn read(&mut self, max: usize) -> ReadOutcome {
        if self.pending.is_empty() {
            match self.input.try_recv() {
                Ok(chunk) => self.pending = chunk,
                Err(TryRecvError::Empty) => return ReadOutcome::WouldBlock,
                Err(TryRecvError::Disconnected) => return ReadOutcome::Exhausted,
            }
        }
        let n = max.min(self.pending.len());
        ReadOutcome::Data(self.pending.split_to(n))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let tx = self.output.as_ref().ok_or(RelStreamError::ChannelClosed)?;
        if data.is_empty() {
            return Ok(0);
        }
        match tx.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => Ok(data.len()),
            Err(TrySendError::Full(_)) => Ok(0),
            Err(TrySendError::Closed(_)) => Err(RelStreamError::ChannelClosed),
        }
    }

    fn finish(&mut self) {
        // Dropping the sender lets the writer task flush and shut down.
        self.output = None;
    }

    fn available_space(&self) -> usize {
        self.output
            .as_ref()
            .map_or(0, |tx| tx.capacity() * MAX_PAYLOAD)
    }
}

async fn read_task<R>(mut reader: R, tx: mpsc::Sender<Bytes>, readiness: Arc<Notify>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_PAYLOAD];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
                readiness.notify_one();
            }
            Err(err) => {
                tracing::warn!(error = %err, "application input failed, treating as end of stream");
                break;
            }
        }
    }
    drop(tx);
    readiness.notify_one();
}

async fn write_task<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, readiness: Arc<Notify>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        let written = match writer.write_all(&chunk).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::warn!(error = %err, "application output failed");
            return;
        }
        readiness.notify_one();
    }
    if let Err(err) = writer.shutdown().await {
        tracing::debug!(error = %err, "application output shutdown failed");
    }
}
