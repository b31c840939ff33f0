//! Push/notify delivery strategy.
//!
//! Subscribes to a notification channel that announces `run_start`,
//! `new_frame` and `run_stop` events, resolves each against the catalog,
//! and drives the same tracker/sequencer transitions as the polling
//! strategy. The notification connection reconnects with backoff; the
//! `delivered` set lives here, not in the channel, so a reconnect never
//! re-emits already-delivered frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use crate::catalog::RunCatalog;
use crate::channel::MessageSink;
use crate::error::{AppResult, ChannelError};
use crate::messages::{LifecycleEvent, Notification};
use crate::recovery::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::tracker::RunTracker;

use super::{deliver_frames, send_with_retry};

/// A stream of catalog notifications.
///
/// `next` returns `Ok(None)` when the stream is finished for good;
/// implementations are expected to absorb reconnects internally.
#[async_trait]
pub trait NotificationSource: Send {
    /// The next notification.
    async fn next(&mut self) -> Result<Option<Notification>, ChannelError>;
}

/// Notifications as newline-delimited JSON over TCP.
///
/// Lines that do not parse as a [`Notification`] are logged and skipped so
/// an unknown message type cannot wedge the stream.
pub struct JsonLinesSource {
    addr: String,
    retry: RetryPolicy,
    lines: Option<FramedRead<TcpStream, LinesCodec>>,
}

impl JsonLinesSource {
    /// A source that connects on first use.
    pub fn new(addr: &str, retry: RetryPolicy) -> Self {
        Self {
            addr: addr.to_string(),
            retry,
            lines: None,
        }
    }

    async fn ensure_connected(
        &mut self,
    ) -> Result<&mut FramedRead<TcpStream, LinesCodec>, ChannelError> {
        if self.lines.is_none() {
            let addr = self.addr.clone();
            let stream = self
                .retry
                .run(|| {
                    let addr = addr.clone();
                    async move { TcpStream::connect(&addr).await }
                })
                .await?;
            info!(addr = %self.addr, "notification channel connected");
            self.lines = Some(FramedRead::new(stream, LinesCodec::new()));
        }
        match self.lines.as_mut() {
            Some(lines) => Ok(lines),
            // Unreachable: freshly set above when it was None.
            None => Err(ChannelError::Closed),
        }
    }
}

#[async_trait]
impl NotificationSource for JsonLinesSource {
    async fn next(&mut self) -> Result<Option<Notification>, ChannelError> {
        loop {
            let lines = self.ensure_connected().await?;
            match lines.next().await {
                Some(Ok(line)) => match serde_json::from_str::<Notification>(&line) {
                    Ok(notification) => return Ok(Some(notification)),
                    Err(err) => {
                        warn!(error = %err, "unparseable notification; skipping");
                    }
                },
                Some(Err(err)) => {
                    warn!(error = %err, "notification read failed; reconnecting");
                    self.lines = None;
                }
                None => {
                    warn!(addr = %self.addr, "notification channel closed; reconnecting");
                    self.lines = None;
                }
            }
        }
    }
}

/// Tunables for the push driver.
#[derive(Clone, Debug)]
pub struct NotifyOptions {
    /// Attempts to drain remaining gaps after `run_stop`, spaced by
    /// `drain_delay`, before the run closes anyway.
    pub drain_grace_cycles: u32,
    /// Pause between drain attempts.
    pub drain_delay: Duration,
    /// Send retry policy.
    pub retry: RetryPolicy,
}

impl Default for NotifyOptions {
    fn default() -> Self {
        Self {
            drain_grace_cycles: 3,
            drain_delay: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

/// The push/notify delivery driver.
pub struct NotifyDriver<N, S> {
    source: N,
    catalog: Arc<dyn RunCatalog>,
    segments: Vec<String>,
    options: NotifyOptions,
    sink: S,
    tracker: RunTracker,
    shutdown: ShutdownSignal,
}

impl<N, S> NotifyDriver<N, S>
where
    N: NotificationSource,
    S: MessageSink<LifecycleEvent>,
{
    /// Build a driver fed by `source`, resolving data through `catalog`.
    pub fn new(
        source: N,
        catalog: Arc<dyn RunCatalog>,
        segments: Vec<String>,
        options: NotifyOptions,
        sink: S,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            catalog,
            segments,
            options,
            sink,
            tracker: RunTracker::new(),
            shutdown,
        }
    }

    /// Run until shutdown or the notification stream ends.
    pub async fn run(mut self) -> AppResult<()> {
        info!("notify driver started");
        let mut shutdown = self.shutdown.clone();
        loop {
            let notification = tokio::select! {
                _ = shutdown.recv() => break,
                notification = self.source.next() => notification?,
            };
            let Some(notification) = notification else {
                info!("notification stream finished");
                break;
            };
            debug!(?notification, "notification");
            match notification {
                Notification::RunStart { run_id } => {
                    self.observe(&run_id).await?;
                    self.deliver_and_maybe_close().await?;
                }
                Notification::NewFrame { run_id, .. } => {
                    // A missed run_start (reconnect window) is recovered
                    // here: resolving the run starts it before its frames.
                    self.observe(&run_id).await?;
                    self.deliver_and_maybe_close().await?;
                }
                Notification::RunStop { run_id } => {
                    if self.tracker.active().map(|run| run.info.run_id.as_str())
                        == Some(run_id.as_str())
                    {
                        self.tracker.observe_stop_document();
                        self.drain_and_close().await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve a run id against the catalog and feed it to the tracker.
    async fn observe(&mut self, run_id: &str) -> AppResult<()> {
        let info = match self.catalog.run_info(run_id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!(run_id, "notified run not in catalog yet; waiting for next notification");
                return Ok(());
            }
            Err(err) if err.is_transient() => {
                warn!(run_id, error = %err, "catalog unreachable; waiting for next notification");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        for event in self.tracker.observe_run(info) {
            send_with_retry(&mut self.sink, &event, &self.options.retry).await?;
        }
        Ok(())
    }

    /// Deliver pending frames; close if the stop document has been seen and
    /// everything drained.
    async fn deliver_and_maybe_close(&mut self) -> AppResult<()> {
        let Some(run) = self.tracker.active_mut() else {
            return Ok(());
        };
        let run_id = run.info.run_id.clone();
        let available = match self.catalog.frame_count(&run_id, &self.segments).await {
            Ok(len) => len,
            Err(err) if err.is_transient() => {
                warn!(run_id = %run_id, error = %err, "frame count unavailable");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        deliver_frames(
            self.catalog.as_ref(),
            &self.segments,
            run,
            available,
            &mut self.sink,
            &self.options.retry,
            &self.shutdown,
        )
        .await?;
        if let Some(stop) = self.tracker.try_close(available, false) {
            send_with_retry(&mut self.sink, &stop, &self.options.retry).await?;
        }
        Ok(())
    }

    /// After `run_stop`: retry remaining gaps a bounded number of times,
    /// then close the run regardless, so a dropped frame cannot hold the
    /// stream open forever.
    async fn drain_and_close(&mut self) -> AppResult<()> {
        for _ in 0..=self.options.drain_grace_cycles {
            self.deliver_and_maybe_close().await?;
            if self.tracker.active().is_none() {
                return Ok(());
            }
            if self.shutdown.is_shutdown() {
                return Ok(());
            }
            sleep(self.options.drain_delay).await;
        }
        let available = self
            .tracker
            .active()
            .map(|run| run.seq.last_known_length())
            .unwrap_or_default();
        if let Some(stop) = self.tracker.try_close(available, true) {
            send_with_retry(&mut self.sink, &stop, &self.options.retry).await?;
        }
        Ok(())
    }
}
