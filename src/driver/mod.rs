//! Delivery drivers: the scheduling loops that bind a [`RunTracker`] and
//! its sequencing state to a catalog and emit the ordered lifecycle stream.
//!
//! Two interchangeable strategies implement the same output contract:
//! [`polling::PollingDriver`] asks the catalog on a fixed interval, and
//! [`notify::NotifyDriver`] reacts to a push notification channel. Both
//! guarantee that Start precedes the first Frame, that frames go out one at
//! a time in exactly the sequencer's order — each credited only after its
//! send succeeds — and that Stop follows the last frame.

pub mod notify;
pub mod polling;

use tracing::{debug, warn};

use crate::catalog::{node_path, RunCatalog};
use crate::channel::{send_with_retry as channel_send_with_retry, MessageSink};
use crate::error::{AppResult, ChannelError};
use crate::messages::{FrameEvent, LifecycleEvent};
use crate::recovery::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::tracker::ActiveRun;

/// Send one lifecycle event, retrying per `retry`. Exhausting the budget
/// surfaces as a run-level failure; the caller must not credit the event as
/// delivered.
pub(crate) async fn send_with_retry<S>(
    sink: &mut S,
    event: &LifecycleEvent,
    retry: &RetryPolicy,
) -> Result<(), ChannelError>
where
    S: MessageSink<LifecycleEvent> + ?Sized,
{
    channel_send_with_retry(sink, event, retry, event.kind()).await
}

/// Deliver the run's currently pending frames, one at a time.
///
/// Each frame is fetched, sent, and only then credited via
/// `mark_delivered`, so memory stays bounded to one in-flight frame and a
/// failure is attributable to a single index. Transient catalog errors end
/// the pass early (retried next cycle); malformed frames are skipped
/// without credit so the gap-fill picks them up again. Returns the number
/// of frames delivered.
pub(crate) async fn deliver_frames<C, S>(
    catalog: &C,
    segments: &[String],
    run: &mut ActiveRun,
    available_length: u64,
    sink: &mut S,
    retry: &RetryPolicy,
    shutdown: &ShutdownSignal,
) -> AppResult<u64>
where
    C: RunCatalog + ?Sized,
    S: MessageSink<LifecycleEvent> + ?Sized,
{
    let run_id = run.info.run_id.clone();
    let mut delivered = 0u64;
    for index in run.seq.pending(available_length) {
        if shutdown.is_shutdown() {
            break;
        }
        let image = match catalog.read_frame(&run_id, segments, index).await {
            Ok(image) => image,
            Err(err) if err.is_transient() => {
                warn!(run_id = %run_id, index, error = %err, "frame fetch failed; retrying next cycle");
                break;
            }
            Err(err) => {
                warn!(run_id = %run_id, index, error = %err, "skipping malformed frame");
                continue;
            }
        };
        if !image.is_well_formed() {
            warn!(run_id = %run_id, index, "frame bytes do not match declared shape; skipping");
            continue;
        }
        let event = LifecycleEvent::Event(FrameEvent {
            frame_number: index,
            image,
            source_locator: format!("{}[{index}]", node_path(&run_id, segments)),
        });
        send_with_retry(sink, &event, retry).await?;
        run.seq.mark_delivered(index);
        delivered += 1;
        debug!(run_id = %run_id, index, "frame delivered");
    }
    Ok(delivered)
}
