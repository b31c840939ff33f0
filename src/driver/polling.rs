//! Polling delivery strategy.
//!
//! On a fixed interval: ask the catalog for the current most-recent run
//! (or the pinned run in single-run mode), feed it through the tracker,
//! deliver pending frames, and close the run once it has drained after its
//! stop document. The loop never terminates on a transient catalog error —
//! sequencing state is kept and the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::catalog::RunCatalog;
use crate::channel::MessageSink;
use crate::error::AppResult;
use crate::messages::LifecycleEvent;
use crate::recovery::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::tracker::RunTracker;

use super::{deliver_frames, send_with_retry};

/// Tunables for the polling loop.
#[derive(Clone, Debug)]
pub struct PollerOptions {
    /// Time between poll cycles.
    pub poll_interval: Duration,
    /// Deliver exactly this run and stop, instead of following the catalog.
    pub single_run_id: Option<String>,
    /// Cycles to keep retrying gaps after the stop document with no
    /// progress, before the run is closed anyway.
    pub drain_grace_cycles: u32,
    /// Send retry policy.
    pub retry: RetryPolicy,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            single_run_id: None,
            drain_grace_cycles: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// The polling delivery driver. One logical worker; owns its sink and its
/// tracker, shares the catalog handle read-only.
pub struct PollingDriver<S> {
    catalog: Arc<dyn RunCatalog>,
    segments: Vec<String>,
    options: PollerOptions,
    sink: S,
    tracker: RunTracker,
    shutdown: ShutdownSignal,
    stall_cycles: u32,
}

impl<S> PollingDriver<S>
where
    S: MessageSink<LifecycleEvent>,
{
    /// Build a driver over `catalog`, emitting into `sink`.
    pub fn new(
        catalog: Arc<dyn RunCatalog>,
        segments: Vec<String>,
        options: PollerOptions,
        sink: S,
        shutdown: ShutdownSignal,
    ) -> Self {
        let tracker = if options.single_run_id.is_some() {
            RunTracker::single_run()
        } else {
            RunTracker::new()
        };
        Self {
            catalog,
            segments,
            options,
            sink,
            tracker,
            shutdown,
            stall_cycles: 0,
        }
    }

    /// Run until shutdown — or, in single-run mode, until the pinned run
    /// has been fully delivered.
    pub async fn run(mut self) -> AppResult<()> {
        info!(
            poll_interval = ?self.options.poll_interval,
            single_run = ?self.options.single_run_id,
            "polling driver started"
        );
        let mut ticks = interval(self.options.poll_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticks.tick() => {
                    self.cycle().await?;
                    if self.tracker.is_finished() {
                        info!("single run delivered; driver finished");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// One fetch/compute/emit cycle.
    async fn cycle(&mut self) -> AppResult<()> {
        // Discovery.
        let latest = match &self.options.single_run_id {
            Some(run_id) => self.catalog.run_info(run_id).await,
            None => self.catalog.most_recent_run().await,
        };
        let latest = match latest {
            Ok(latest) => latest,
            Err(err) if err.is_transient() => {
                warn!(error = %err, "catalog unreachable; retrying next cycle");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if let Some(info) = latest {
            for event in self.tracker.observe_run(info) {
                send_with_retry(&mut self.sink, &event, &self.options.retry).await?;
            }
        }
        let Some(run) = self.tracker.active_mut() else {
            return Ok(());
        };

        // Delivery.
        let run_id = run.info.run_id.clone();
        let available = match self.catalog.frame_count(&run_id, &self.segments).await {
            Ok(len) => len,
            Err(err) if err.is_transient() => {
                warn!(run_id = %run_id, error = %err, "frame count unavailable; retrying next cycle");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let delivered = deliver_frames(
            self.catalog.as_ref(),
            &self.segments,
            run,
            available,
            &mut self.sink,
            &self.options.retry,
            &self.shutdown,
        )
        .await?;

        // Closing: drain before close, with a bounded grace for gaps that
        // will never arrive.
        if run.stop_seen && delivered == 0 && !run.seq.is_drained(available) {
            self.stall_cycles += 1;
        } else {
            self.stall_cycles = 0;
        }
        let force = self.stall_cycles > self.options.drain_grace_cycles;
        if let Some(stop) = self.tracker.try_close(available, force) {
            send_with_retry(&mut self.sink, &stop, &self.options.retry).await?;
            self.stall_cycles = 0;
        }
        Ok(())
    }
}
