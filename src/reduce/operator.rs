//! The reduction operator: a worker stage between two channels.
//!
//! Consumes a lifecycle stream, reduces each frame on the blocking thread
//! pool, and republishes derived events to its publishers. Start and Stop
//! pass through unchanged so downstream consumers keep the run framing.
//! Exactly-once delivery is the upstream driver's job; a frame that fails
//! to reduce is logged and skipped, never crashing the run.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::channel::{send_with_retry, MessageSink, MessageSource};
use crate::error::AppResult;
use crate::messages::{
    CurveEvent, DerivedEvent, FrameEvent, LatentSpaceEvent, LifecycleEvent,
};
use crate::recovery::RetryPolicy;
use crate::shutdown::ShutdownSignal;

use super::{FrameReducer, ReducedArtifact};

/// Fan-out list of derived-event publishers.
pub type PublisherList = Vec<Box<dyn MessageSink<DerivedEvent> + Sync>>;

/// The worker stage.
pub struct ReductionOperator<Src> {
    source: Src,
    publishers: PublisherList,
    reducer: Arc<dyn FrameReducer>,
    retry: RetryPolicy,
    shutdown: ShutdownSignal,
}

impl<Src> ReductionOperator<Src>
where
    Src: MessageSource<LifecycleEvent>,
{
    /// Build an operator reducing `source` with `reducer`.
    pub fn new(
        source: Src,
        reducer: Arc<dyn FrameReducer>,
        publishers: PublisherList,
        retry: RetryPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            publishers,
            reducer,
            retry,
            shutdown,
        }
    }

    /// Run until the source finishes or shutdown is requested.
    pub async fn run(mut self) -> AppResult<()> {
        info!("reduction operator started");
        let mut shutdown = self.shutdown.clone();
        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => break,
                event = self.source.recv() => event?,
            };
            let Some(event) = event else {
                info!("lifecycle stream finished");
                break;
            };
            match event {
                LifecycleEvent::Start(start) => {
                    debug!(run_id = %start.run_id, "run started");
                    self.publish(&DerivedEvent::Start(start)).await?;
                }
                LifecycleEvent::Event(frame) => {
                    if let Some(derived) = self.reduce_frame(frame).await {
                        self.publish(&derived).await?;
                    }
                }
                LifecycleEvent::Stop(stop) => {
                    debug!(num_frames = stop.num_frames, "run stopped");
                    self.publish(&DerivedEvent::Stop(stop)).await?;
                }
            }
        }
        Ok(())
    }

    /// Reduce one frame off the event loop. `None` means the frame was
    /// skipped (reduction failed); the run keeps going.
    async fn reduce_frame(&self, frame: FrameEvent) -> Option<DerivedEvent> {
        let reducer = Arc::clone(&self.reducer);
        let frame_number = frame.frame_number;
        let image = frame.image;
        let reduced =
            tokio::task::spawn_blocking(move || reducer.reduce(&image)).await;
        match reduced {
            Ok(Ok(ReducedArtifact::Curve { q, intensity })) => {
                Some(DerivedEvent::OneDReduction(CurveEvent {
                    frame_number,
                    q,
                    intensity,
                }))
            }
            Ok(Ok(ReducedArtifact::FeatureVector(feature_vector))) => {
                Some(DerivedEvent::LatentSpace(LatentSpaceEvent {
                    frame_number,
                    feature_vector,
                }))
            }
            Ok(Err(err)) => {
                warn!(frame_number, error = %err, "reduction failed; skipping frame");
                None
            }
            Err(err) => {
                error!(frame_number, error = %err, "reduction task panicked; skipping frame");
                None
            }
        }
    }

    async fn publish(&mut self, event: &DerivedEvent) -> AppResult<()> {
        for publisher in &mut self.publishers {
            send_with_retry(publisher.as_mut(), event, &self.retry, "derived").await?;
        }
        Ok(())
    }
}
