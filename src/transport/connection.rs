//! A framed, bidirectional connection over a Unix stream socket.
//!
//! Reads happen on the owner's task through a `FramedRead`. Writes from any
//! number of [`FrameSender`] clones are funnelled through one writer task
//! per connection, so whole frames always reach the socket one at a time.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::backoff::BackoffStrategy;
use crate::transport::codec::EnvelopeCodec;
use crate::transport::message::{Envelope, Message};
use crate::transport::TransportError;

/// Outbound frames buffered per connection before senders wait.
const WRITE_QUEUE_DEPTH: usize = 64;

struct Outgoing {
    envelope: Envelope,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

/// Cloneable handle for sending on a connection.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Outgoing>,
}

impl FrameSender {
    /// Send one message and wait until it has been written and flushed.
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.send_envelope(Envelope::new(message)).await
    }

    pub async fn send_envelope(&self, envelope: Envelope) -> Result<(), TransportError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Outgoing { envelope, ack })
            .await
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)?
    }

    /// Queue one message without waiting for the peer. Fails with
    /// [`TransportError::QueueFull`] when the writer is backed up.
    pub fn try_send(&self, message: Message) -> Result<(), TransportError> {
        let (ack, _) = oneshot::channel();
        self.tx
            .try_send(Outgoing {
                envelope: Envelope::new(message),
                ack,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving half of a connection.
pub struct FrameReader {
    inner: FramedRead<OwnedReadHalf, EnvelopeCodec>,
}

impl FrameReader {
    /// Next envelope, `Ok(None)` when the peer closed cleanly between frames.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        self.inner.next().await.transpose()
    }
}

pub struct Connection {
    reader: FrameReader,
    sender: FrameSender,
}

impl Connection {
    pub fn new(stream: UnixStream, max_frame_len: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        let reader = FrameReader {
            inner: FramedRead::new(read_half, EnvelopeCodec::new(max_frame_len)),
        };
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(write_loop(
            FramedWrite::new(write_half, EnvelopeCodec::new(max_frame_len)),
            rx,
        ));
        Self {
            reader,
            sender: FrameSender { tx },
        }
    }

    pub async fn connect(path: &Path, max_frame_len: usize) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(path).await?;
        debug!(path = %path.display(), "connected");
        Ok(Self::new(stream, max_frame_len))
    }

    /// Connect, retrying up to `attempts` times with the given backoff.
    pub async fn connect_with_retry(
        path: &Path,
        max_frame_len: usize,
        attempts: u32,
        backoff: &BackoffStrategy,
    ) -> Result<Self, TransportError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::connect(path, max_frame_len).await {
                Ok(connection) => return Ok(connection),
                Err(e) if attempt < attempts => {
                    let delay: Duration = backoff.delay_for(attempt);
                    warn!(
                        path = %path.display(),
                        attempt,
                        delay_ms = crate::util::millis(delay),
                        error = %e,
                        "connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.sender.send(message).await
    }

    pub async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        self.reader.recv().await
    }

    pub fn split(self) -> (FrameReader, FrameSender) {
        (self.reader, self.sender)
    }
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, EnvelopeCodec>,
    mut rx: mpsc::Receiver<Outgoing>,
) {
    while let Some(outgoing) = rx.recv().await {
        let kind = outgoing.envelope.message.name();
        let result = writer.send(outgoing.envelope).await;
        let failed = result.is_err();
        if let Err(e) = &result {
            warn!(message = kind, error = %e, "write failed, closing connection");
        } else {
            trace!(message = kind, "frame written");
        }
        let _ = outgoing.ack.send(result);
        if failed {
            break;
        }
    }
    rx.close();
    let _ = writer.close().await;
}
