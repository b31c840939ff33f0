//! Run lifecycle tracking.
//!
//! [`RunTracker`] is the state machine deciding when runs open and close:
//! `Idle` until the catalog exposes a run, `Active` while frames are being
//! delivered, back to `Idle` once the run drains after its stop document.
//! Transitions *return* the lifecycle events to emit rather than emitting
//! them, so the polling and push drivers share one transition table and the
//! caller controls when an event counts as sent.
//!
//! Ordering guarantees enforced here:
//! - a `Start` is returned exactly once per run, always before the caller
//!   can deliver any of its frames;
//! - a `Stop` is returned exactly once, only after the caller reports the
//!   run drained (or explicitly abandons it);
//! - observing a different most-recent run while one is active returns a
//!   synthetic aborted `Stop` for the old run *followed by* the new `Start` —
//!   never two `Start`s back to back.

use tracing::{info, warn};

use crate::catalog::RunInfo;
use crate::messages::{LifecycleEvent, StopEvent};
use crate::sequencer::SequencingState;

/// The run currently being delivered.
#[derive(Debug)]
pub struct ActiveRun {
    /// Catalog snapshot of the run.
    pub info: RunInfo,
    /// Delivery bookkeeping, discarded when the run closes.
    pub seq: SequencingState,
    /// True once the catalog has exposed the run's stop document.
    pub stop_seen: bool,
}

/// Tracker state: no run, or one active run.
#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Active(ActiveRun),
}

/// The current-run state machine.
#[derive(Debug, Default)]
pub struct RunTracker {
    state: State,
    /// In single-run mode discovery stops after the first run.
    single_run: bool,
    finished: bool,
    /// The most recently closed run. The catalog keeps reporting a stopped
    /// run as most-recent until the next one starts; without this a closed
    /// run would be rediscovered and re-delivered.
    last_closed: Option<String>,
}

impl RunTracker {
    /// A tracker that follows the catalog's most recent run indefinitely.
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker that delivers exactly one run and then reports finished.
    pub fn single_run() -> Self {
        Self {
            single_run: true,
            ..Self::default()
        }
    }

    /// The active run's mutable state, if any.
    pub fn active_mut(&mut self) -> Option<&mut ActiveRun> {
        match &mut self.state {
            State::Active(run) => Some(run),
            State::Idle => None,
        }
    }

    /// The active run, if any.
    pub fn active(&self) -> Option<&ActiveRun> {
        match &self.state {
            State::Active(run) => Some(run),
            State::Idle => None,
        }
    }

    /// True once a single-run tracker has closed its run.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed the catalog's current most-recent run into the state machine.
    ///
    /// Returns the events to emit, in order. A new run while another is
    /// active yields `[Stop{aborted}, Start]`; the same run (or a finished
    /// tracker) yields nothing.
    pub fn observe_run(&mut self, latest: RunInfo) -> Vec<LifecycleEvent> {
        if self.finished {
            return Vec::new();
        }
        if self.last_closed.as_deref() == Some(latest.run_id.as_str()) {
            // An already-closed run resurfacing as most-recent is not a new
            // run; its events went out exactly once.
            return Vec::new();
        }
        match &mut self.state {
            State::Idle => {
                info!(run_id = %latest.run_id, run_name = %latest.run_name, "starting run");
                let start = LifecycleEvent::Start(latest.start_event());
                // A run discovered mid-acquisition may already be stopped;
                // its historical frames still get a full backfill.
                let stop_seen = latest.has_stop;
                self.state = State::Active(ActiveRun {
                    info: latest,
                    seq: SequencingState::new(),
                    stop_seen,
                });
                vec![start]
            }
            State::Active(active) if active.info.run_id == latest.run_id => {
                // Same run; pick up a stop document the catalog wrote since
                // the last observation.
                if latest.has_stop && !active.stop_seen {
                    active.stop_seen = true;
                }
                active.info = latest;
                Vec::new()
            }
            State::Active(active) => {
                if self.single_run {
                    // Pinned to one run; later runs are not ours to deliver.
                    return Vec::new();
                }
                warn!(
                    old_run = %active.info.run_id,
                    new_run = %latest.run_id,
                    delivered = active.seq.delivered_count(),
                    "run superseded before its stop document; closing as aborted"
                );
                let stop = LifecycleEvent::Stop(StopEvent {
                    num_frames: active.seq.delivered_count(),
                    aborted: true,
                });
                self.last_closed = Some(active.info.run_id.clone());
                let start = LifecycleEvent::Start(latest.start_event());
                let stop_seen = latest.has_stop;
                self.state = State::Active(ActiveRun {
                    info: latest,
                    seq: SequencingState::new(),
                    stop_seen,
                });
                vec![stop, start]
            }
        }
    }

    /// Record that the active run's stop document has been observed.
    pub fn observe_stop_document(&mut self) {
        if let State::Active(active) = &mut self.state {
            active.stop_seen = true;
        }
    }

    /// Close the active run if its stop document has been seen and delivery
    /// has drained to `available_length` — or unconditionally when `force`
    /// is set (gap abandonment after the drain grace expires).
    ///
    /// Stop is never returned while frames are still pending, so a slow
    /// consumer cannot observe a truncated run.
    pub fn try_close(&mut self, available_length: u64, force: bool) -> Option<LifecycleEvent> {
        let State::Active(active) = &mut self.state else {
            return None;
        };
        if !active.stop_seen {
            return None;
        }
        if !active.seq.is_drained(available_length) && !force {
            return None;
        }
        let delivered = active.seq.delivered_count();
        if delivered < available_length {
            warn!(
                run_id = %active.info.run_id,
                delivered,
                available_length,
                "closing run with undelivered frames"
            );
        }
        info!(run_id = %active.info.run_id, num_frames = delivered, "stopping run");
        self.last_closed = Some(active.info.run_id.clone());
        self.state = State::Idle;
        if self.single_run {
            self.finished = true;
        }
        Some(LifecycleEvent::Stop(StopEvent {
            num_frames: delivered,
            aborted: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str, has_stop: bool) -> RunInfo {
        RunInfo {
            run_id: id.to_string(),
            run_name: format!("scan_{id}"),
            uri: format!("mock://{id}"),
            frame_shape: Some((4, 4)),
            data_type: None,
            has_stop,
        }
    }

    #[test]
    fn test_idle_to_active_emits_one_start() {
        let mut tracker = RunTracker::new();
        let events = tracker.observe_run(run("a", false));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], LifecycleEvent::Start(_)));
        // Observing the same run again is a no-op.
        assert!(tracker.observe_run(run("a", false)).is_empty());
    }

    #[test]
    fn test_stop_requires_stop_document_and_drain() {
        let mut tracker = RunTracker::new();
        tracker.observe_run(run("a", false));
        // No stop document yet.
        assert!(tracker.try_close(2, false).is_none());

        tracker.observe_run(run("a", true));
        // Stop document seen, but two frames remain pending.
        assert!(tracker.try_close(2, false).is_none());

        let seq = &mut tracker.active_mut().unwrap().seq;
        seq.mark_delivered(0);
        seq.mark_delivered(1);
        let stop = tracker.try_close(2, false);
        match stop {
            Some(LifecycleEvent::Stop(stop)) => {
                assert_eq!(stop.num_frames, 2);
                assert!(!stop.aborted);
            }
            other => panic!("expected stop, got {other:?}"),
        }
        assert!(tracker.active().is_none());
    }

    #[test]
    fn test_supersession_aborts_then_starts() {
        let mut tracker = RunTracker::new();
        tracker.observe_run(run("a", false));
        tracker.active_mut().unwrap().seq.mark_delivered(0);

        let events = tracker.observe_run(run("b", false));
        assert_eq!(events.len(), 2);
        match &events[0] {
            LifecycleEvent::Stop(stop) => {
                assert_eq!(stop.num_frames, 1);
                assert!(stop.aborted);
            }
            other => panic!("expected stop first, got {:?}", other.kind()),
        }
        match &events[1] {
            LifecycleEvent::Start(start) => assert_eq!(start.run_id, "b"),
            other => panic!("expected start second, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_single_run_mode_ignores_later_runs() {
        let mut tracker = RunTracker::single_run();
        tracker.observe_run(run("a", true));
        assert!(tracker.observe_run(run("b", false)).is_empty());

        let stop = tracker.try_close(0, false);
        assert!(matches!(stop, Some(LifecycleEvent::Stop(_))));
        assert!(tracker.is_finished());
        // A finished tracker never starts another run.
        assert!(tracker.observe_run(run("b", false)).is_empty());
    }

    #[test]
    fn test_closed_run_is_not_rediscovered() {
        let mut tracker = RunTracker::new();
        tracker.observe_run(run("a", true));
        assert!(tracker.try_close(0, false).is_some());
        // The catalog still reports run a as most recent; it must stay
        // closed.
        assert!(tracker.observe_run(run("a", true)).is_empty());
        // A genuinely new run starts normally.
        let events = tracker.observe_run(run("b", false));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], LifecycleEvent::Start(_)));
    }

    #[test]
    fn test_forced_close_abandons_gaps() {
        let mut tracker = RunTracker::new();
        tracker.observe_run(run("a", true));
        let seq = &mut tracker.active_mut().unwrap().seq;
        seq.mark_delivered(0);
        seq.mark_delivered(2);
        // Gap at 1 never arrives; force-close after the grace period.
        assert!(tracker.try_close(3, false).is_none());
        let stop = tracker.try_close(3, true);
        match stop {
            Some(LifecycleEvent::Stop(stop)) => {
                assert_eq!(stop.num_frames, 2);
                assert!(!stop.aborted);
            }
            other => panic!("expected stop, got {other:?}"),
        }
    }
}
