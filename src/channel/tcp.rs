//! TCP realization of the message channel.
//!
//! Messages travel as length-delimited frames whose payload is the
//! MessagePack wire encoding from [`crate::messages`]. The publisher owns
//! its listening socket exclusively; subscribers own their connection and
//! reconnect with backoff, relying on the producer-side `delivered` state to
//! avoid re-delivery after a reconnect.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::messages;
use crate::recovery::RetryPolicy;

use super::{MessageSink, MessageSource};

type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Fan-out publisher: every connected subscriber receives every message.
pub struct TcpPublisher<T> {
    conns: Arc<Mutex<Vec<FrameWriter>>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    _marker: PhantomData<fn(T)>,
}

impl<T> TcpPublisher<T> {
    /// Bind the publish socket and start accepting subscribers.
    pub async fn bind(addr: &str) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let conns: Arc<Mutex<Vec<FrameWriter>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_conns = Arc::clone(&conns);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "subscriber connected");
                        let (_read, write) = stream.into_split();
                        accept_conns
                            .lock()
                            .await
                            .push(FramedWrite::new(write, super::wire_codec()));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(Self {
            conns,
            local_addr,
            accept_task,
            _marker: PhantomData,
        })
    }

    /// The bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.conns.lock().await.len()
    }
}

impl<T> Drop for TcpPublisher<T> {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl<T> MessageSink<T> for TcpPublisher<T>
where
    T: Serialize + Send + Sync,
{
    async fn send(&mut self, message: &T) -> Result<(), ChannelError> {
        let bytes = messages::encode(message)?;
        let mut conns = self.conns.lock().await;
        let mut kept = Vec::with_capacity(conns.len());
        for mut conn in conns.drain(..) {
            // Awaiting each write is the backpressure: a full kernel buffer
            // suspends the producer instead of dropping the frame.
            match conn.send(bytes.clone()).await {
                Ok(()) => kept.push(conn),
                Err(err) => warn!(error = %err, "dropping disconnected subscriber"),
            }
        }
        *conns = kept;
        Ok(())
    }
}

/// Subscriber end: connects (and reconnects) to a [`TcpPublisher`].
pub struct TcpSubscriber<T> {
    addr: String,
    retry: RetryPolicy,
    framed: Option<FramedRead<TcpStream, LengthDelimitedCodec>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TcpSubscriber<T> {
    /// A subscriber that connects on first use.
    pub fn new(addr: &str, retry: RetryPolicy) -> Self {
        Self {
            addr: addr.to_string(),
            retry,
            framed: None,
            _marker: PhantomData,
        }
    }

    async fn ensure_connected(
        &mut self,
    ) -> Result<&mut FramedRead<TcpStream, LengthDelimitedCodec>, ChannelError> {
        if self.framed.is_none() {
            let addr = self.addr.clone();
            let stream = self
                .retry
                .run(|| {
                    let addr = addr.clone();
                    async move { TcpStream::connect(&addr).await }
                })
                .await?;
            debug!(addr = %self.addr, "subscribed");
            self.framed = Some(FramedRead::new(stream, super::wire_codec()));
        }
        match self.framed.as_mut() {
            Some(framed) => Ok(framed),
            // Unreachable: freshly set above when it was None.
            None => Err(ChannelError::Closed),
        }
    }
}

#[async_trait]
impl<T> MessageSource<T> for TcpSubscriber<T>
where
    T: DeserializeOwned + Send,
{
    async fn recv(&mut self) -> Result<Option<T>, ChannelError> {
        loop {
            let framed = self.ensure_connected().await?;
            match framed.next().await {
                Some(Ok(bytes)) => return Ok(Some(messages::decode(&bytes)?)),
                Some(Err(err)) => {
                    warn!(error = %err, "subscription read failed; reconnecting");
                    self.framed = None;
                }
                None => {
                    warn!(addr = %self.addr, "publisher closed connection; reconnecting");
                    self.framed = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{LifecycleEvent, StopEvent};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 20,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let mut publisher: TcpPublisher<LifecycleEvent> =
            TcpPublisher::bind("127.0.0.1:0").await.unwrap();
        let addr = publisher.local_addr().to_string();

        let mut subscriber: TcpSubscriber<LifecycleEvent> = TcpSubscriber::new(&addr, fast_retry());
        let receive = tokio::spawn(async move { subscriber.recv().await });

        // Wait for the subscription to land before publishing.
        for _ in 0..100 {
            if publisher.subscriber_count().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let event = LifecycleEvent::Stop(StopEvent {
            num_frames: 3,
            aborted: false,
        });
        publisher.send(&event).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), receive)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received, Some(event));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let mut publisher: TcpPublisher<LifecycleEvent> =
            TcpPublisher::bind("127.0.0.1:0").await.unwrap();
        let event = LifecycleEvent::Stop(StopEvent {
            num_frames: 0,
            aborted: false,
        });
        publisher.send(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_gives_up_when_publisher_absent() {
        let retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        // Port 1 is never listening.
        let mut subscriber: TcpSubscriber<LifecycleEvent> =
            TcpSubscriber::new("127.0.0.1:1", retry);
        let result = subscriber.recv().await;
        assert!(matches!(result, Err(ChannelError::Io(_))));
    }
}
