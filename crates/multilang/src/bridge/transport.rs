//! Message transport between the parent and a child process.
//!
//! The session only sees two seams:
//! - [`MessageReader`]: yields the next decoded message from the child
//! - [`MessageWriter`]: submits a message and hands back a [`PendingWrite`]
//!
//! Concrete implementations frame over any AsyncRead/AsyncWrite (child
//! pipes, in-memory duplex streams in tests).

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonLinesCodec;
use super::protocol::{InboundMessage, OutboundMessage};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("child process closed its output stream")]
    Closed,
    #[error("interrupted")]
    Interrupted,
    #[error("writer task is no longer running")]
    WriterGone,
}

/// Source of messages from the child.
///
/// Callers issue one read at a time; a read is never started before the
/// previous one resolved.
#[async_trait]
pub trait MessageReader: Send {
    async fn next_message(&mut self) -> Result<InboundMessage, TransportError>;
}

/// Sink for messages to the child.
///
/// `write` only submits. The returned [`PendingWrite`] resolves once the
/// message was handed to the transport: `Ok(true)` if the transport is still
/// usable, `Ok(false)` if it is not, `Err` if the write could not complete.
pub trait MessageWriter: Send {
    fn write(&mut self, message: OutboundMessage) -> PendingWrite;
}

/// Result of a submitted write, awaited separately from its submission.
#[must_use = "a pending write reports whether the child received the message"]
pub struct PendingWrite {
    inner: BoxFuture<'static, Result<bool, TransportError>>,
}

impl PendingWrite {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<bool, TransportError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }

    /// An already-resolved write.
    pub fn ready(result: Result<bool, TransportError>) -> Self {
        Self::new(futures::future::ready(result))
    }

    fn from_receiver(rx: oneshot::Receiver<Result<bool, TransportError>>) -> Self {
        Self::new(async move { rx.await.unwrap_or(Err(TransportError::WriterGone)) })
    }
}

impl Future for PendingWrite {
    type Output = Result<bool, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWrite").finish_non_exhaustive()
    }
}

/// Reads line-framed JSON messages from the child's stdout.
pub struct FramedReader<R> {
    inner: FramedRead<R, JsonLinesCodec<InboundMessage>>,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_codec(reader, JsonLinesCodec::new())
    }

    pub fn with_codec(reader: R, codec: JsonLinesCodec<InboundMessage>) -> Self {
        Self {
            inner: FramedRead::new(reader, codec),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageReader for FramedReader<R> {
    async fn next_message(&mut self) -> Result<InboundMessage, TransportError> {
        match self.inner.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Err(TransportError::Closed),
        }
    }
}

struct WriteRequest {
    message: OutboundMessage,
    done: oneshot::Sender<Result<bool, TransportError>>,
}

/// Writes to the child's stdin from a dedicated task.
///
/// Writes complete in submission order. After the first failed write the
/// stream is considered closed and later writes resolve to `Ok(false)`
/// without touching it. Dropping the writer closes the stream once queued
/// writes have drained.
pub struct QueuedWriter {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl QueuedWriter {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_codec(writer, JsonLinesCodec::new())
    }

    pub fn with_codec<W>(writer: W, codec: JsonLinesCodec<OutboundMessage>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(FramedWrite::new(writer, codec), rx));
        Self { tx }
    }
}

impl MessageWriter for QueuedWriter {
    fn write(&mut self, message: OutboundMessage) -> PendingWrite {
        let (done, rx) = oneshot::channel();
        if self.tx.send(WriteRequest { message, done }).is_err() {
            return PendingWrite::ready(Err(TransportError::WriterGone));
        }
        PendingWrite::from_receiver(rx)
    }
}

async fn writer_task<W>(
    mut framed: FramedWrite<W, JsonLinesCodec<OutboundMessage>>,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
) where
    W: AsyncWrite + Unpin,
{
    let mut open = true;
    while let Some(WriteRequest { message, done }) = rx.recv().await {
        if open {
            if let Err(e) = framed.send(message).await {
                tracing::error!(error = %e, "Failed to write message to child process");
                open = false;
            }
        } else {
            tracing::warn!(?message, "Dropping message for closed child stream");
        }
        let _ = done.send(Ok(open));
    }
    tracing::trace!("Writer task exiting");
}
