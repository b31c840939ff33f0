//! The message channel between pipeline stages.
//!
//! Both ends of the pipeline depend on the same pair of seams: a
//! [`MessageSink`] the producer pushes into and a [`MessageSource`] the
//! consumer pulls from. The channel is ordered and asynchronous; ordering
//! is the producer's responsibility (drivers credit a frame only after its
//! send succeeds), the channel only has to not reorder.
//!
//! Backpressure is blocking, never dropping: the in-process channel is a
//! bounded `tokio::mpsc` whose `send` suspends when full, and the TCP
//! publisher awaits each subscriber write. Frame loss is never silent.
//!
//! Realizations:
//! - [`bounded`]: in-process channel for wiring stages in one process;
//! - [`tcp::TcpPublisher`] / [`tcp::TcpSubscriber`]: fan-out publish over
//!   length-delimited TCP frames with the MessagePack wire codec;
//! - [`broker::Broker`]: round-robin distribution of opaque frames across a
//!   pool of worker connections.

pub mod broker;
pub mod tcp;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::warn;

use crate::error::ChannelError;
use crate::recovery::RetryPolicy;

/// Upper bound on one wire frame: a full-size detector image with headroom.
/// The codec default of 8 MiB is below a single 1679x1475 uint32 frame.
pub const MAX_WIRE_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// The length-delimited codec every TCP channel end uses.
pub(crate) fn wire_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_WIRE_FRAME_BYTES)
        .new_codec()
}

/// Producer end of a message channel.
#[async_trait]
pub trait MessageSink<T>: Send
where
    T: Send + Sync,
{
    /// Deliver one message, suspending under backpressure.
    async fn send(&mut self, message: &T) -> Result<(), ChannelError>;
}

/// Consumer end of a message channel.
#[async_trait]
pub trait MessageSource<T>: Send
where
    T: Send,
{
    /// The next message, or `None` when the channel is finished.
    async fn recv(&mut self) -> Result<Option<T>, ChannelError>;
}

/// Create a bounded in-process channel with a high-water mark of
/// `capacity` messages.
pub fn bounded<T: Send>(capacity: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (BoundedSender { tx }, BoundedReceiver { rx })
}

/// Sending half of [`bounded`].
#[derive(Clone, Debug)]
pub struct BoundedSender<T> {
    tx: mpsc::Sender<T>,
}

#[async_trait]
impl<T> MessageSink<T> for BoundedSender<T>
where
    T: Clone + Send + Sync,
{
    async fn send(&mut self, message: &T) -> Result<(), ChannelError> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

/// Receiving half of [`bounded`].
#[derive(Debug)]
pub struct BoundedReceiver<T> {
    rx: mpsc::Receiver<T>,
}

#[async_trait]
impl<T> MessageSource<T> for BoundedReceiver<T>
where
    T: Send,
{
    async fn recv(&mut self) -> Result<Option<T>, ChannelError> {
        Ok(self.rx.recv().await)
    }
}

/// Send one message, retrying per `retry`; `label` names the message in
/// logs. Exhausting the budget surfaces as an error so the caller can treat
/// it as a run-level failure — the message must not be credited as
/// delivered.
pub async fn send_with_retry<T, S>(
    sink: &mut S,
    message: &T,
    retry: &RetryPolicy,
    label: &str,
) -> Result<(), ChannelError>
where
    T: Send + Sync,
    S: MessageSink<T> + ?Sized,
{
    let mut attempt = 0;
    loop {
        match sink.send(message).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt + 1 >= retry.max_attempts => {
                warn!(label, error = %err, "send failed; retries exhausted");
                return Err(ChannelError::RetriesExhausted(retry.max_attempts));
            }
            Err(err) => {
                warn!(label, attempt, error = %err, "send failed; retrying");
                sleep(retry.backoff_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// Fans one message stream out to several sinks, in order.
///
/// A failing member sink fails the whole send; the caller's retry policy
/// decides what happens next, so no member silently misses a message.
pub struct FanOutSink<T> {
    sinks: Vec<Box<dyn MessageSink<T>>>,
}

impl<T> FanOutSink<T> {
    /// A fan-out over `sinks`.
    pub fn new(sinks: Vec<Box<dyn MessageSink<T>>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl<T> MessageSink<T> for FanOutSink<T>
where
    T: Send + Sync,
{
    async fn send(&mut self, message: &T) -> Result<(), ChannelError> {
        for sink in &mut self.sinks {
            sink.send(message).await?;
        }
        Ok(())
    }
}
