//! Push-driver tests with a scripted notification source.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use saxs_stream::catalog::mock::MockCatalog;
use saxs_stream::catalog::RunCatalog;
use saxs_stream::channel::{bounded, MessageSource};
use saxs_stream::driver::notify::{NotificationSource, NotifyDriver, NotifyOptions};
use saxs_stream::error::ChannelError;
use saxs_stream::messages::{LifecycleEvent, Notification};
use saxs_stream::shutdown;
use saxs_stream::sim::synthetic_frame;

/// Replays a fixed list of notifications, then reports the stream finished.
struct ScriptedSource {
    notifications: VecDeque<Notification>,
}

impl ScriptedSource {
    fn new(notifications: Vec<Notification>) -> Self {
        Self {
            notifications: notifications.into(),
        }
    }
}

#[async_trait]
impl NotificationSource for ScriptedSource {
    async fn next(&mut self) -> Result<Option<Notification>, ChannelError> {
        Ok(self.notifications.pop_front())
    }
}

fn segments() -> Vec<String> {
    vec!["primary".to_string(), "data".to_string(), "image".to_string()]
}

fn fast_options() -> NotifyOptions {
    NotifyOptions {
        drain_grace_cycles: 2,
        drain_delay: Duration::from_millis(10),
        ..NotifyOptions::default()
    }
}

async fn run_driver(
    catalog: MockCatalog,
    notifications: Vec<Notification>,
) -> Vec<LifecycleEvent> {
    let (tx, mut rx) = bounded::<LifecycleEvent>(64);
    let driver = NotifyDriver::new(
        ScriptedSource::new(notifications),
        Arc::new(catalog) as Arc<dyn RunCatalog>,
        segments(),
        fast_options(),
        tx,
        shutdown::ShutdownSignal::never(),
    );
    tokio::time::timeout(Duration::from_secs(5), driver.run())
        .await
        .expect("driver timed out")
        .expect("driver failed");
    let mut events = Vec::new();
    while let Ok(Some(event)) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_notifications_drive_a_complete_run() {
    let catalog = MockCatalog::new();
    catalog.create_run("r", "scan");
    catalog.append_frame("r", synthetic_frame(8, 8, 0));
    catalog.append_frame("r", synthetic_frame(8, 8, 1));
    catalog.set_stop("r");

    let events = run_driver(
        catalog,
        vec![
            Notification::RunStart {
                run_id: "r".to_string(),
            },
            Notification::NewFrame {
                run_id: "r".to_string(),
                frame_number: 0,
            },
            Notification::NewFrame {
                run_id: "r".to_string(),
                frame_number: 1,
            },
            Notification::RunStop {
                run_id: "r".to_string(),
            },
        ],
    )
    .await;

    assert_eq!(events.len(), 4);
    assert!(matches!(&events[0], LifecycleEvent::Start(start) if start.run_id == "r"));
    assert!(matches!(&events[1], LifecycleEvent::Event(frame) if frame.frame_number == 0));
    assert!(matches!(&events[2], LifecycleEvent::Event(frame) if frame.frame_number == 1));
    assert!(matches!(&events[3], LifecycleEvent::Stop(stop) if stop.num_frames == 2));
}

#[tokio::test]
async fn test_duplicate_frame_notifications_deliver_once() {
    let catalog = MockCatalog::new();
    catalog.create_run("r", "scan");
    catalog.append_frame("r", synthetic_frame(8, 8, 0));
    catalog.set_stop("r");

    // The same frame announced three times — as after a notification
    // channel reconnect — must come out exactly once.
    let events = run_driver(
        catalog,
        vec![
            Notification::RunStart {
                run_id: "r".to_string(),
            },
            Notification::NewFrame {
                run_id: "r".to_string(),
                frame_number: 0,
            },
            Notification::NewFrame {
                run_id: "r".to_string(),
                frame_number: 0,
            },
            Notification::NewFrame {
                run_id: "r".to_string(),
                frame_number: 0,
            },
            Notification::RunStop {
                run_id: "r".to_string(),
            },
        ],
    )
    .await;

    assert_eq!(events.len(), 3, "Start, one Frame, Stop: {events:?}");
    assert!(matches!(&events[1], LifecycleEvent::Event(frame) if frame.frame_number == 0));
}

#[tokio::test]
async fn test_missed_run_start_is_recovered_from_new_frame() {
    let catalog = MockCatalog::new();
    catalog.create_run("r", "scan");
    catalog.append_frame("r", synthetic_frame(8, 8, 0));
    catalog.set_stop("r");

    // The run_start was lost in a reconnect window; the first new_frame
    // must still open the run before delivering.
    let events = run_driver(
        catalog,
        vec![
            Notification::NewFrame {
                run_id: "r".to_string(),
                frame_number: 0,
            },
            Notification::RunStop {
                run_id: "r".to_string(),
            },
        ],
    )
    .await;

    assert!(matches!(&events[0], LifecycleEvent::Start(_)));
    assert!(matches!(&events[1], LifecycleEvent::Event(_)));
    assert!(matches!(&events[2], LifecycleEvent::Stop(_)));
}

#[tokio::test]
async fn test_run_stop_with_permanent_gap_closes_after_grace() {
    use bytes::Bytes;
    use saxs_stream::messages::{DType, ImagePayload};

    let catalog = MockCatalog::new();
    catalog.create_run("r", "scan");
    catalog.append_frame("r", synthetic_frame(8, 8, 0));
    // Frame 1 is permanently malformed: it is skipped on every pass, so
    // the run can only close through the drain grace.
    catalog.append_frame(
        "r",
        ImagePayload {
            data: Bytes::from_static(&[1, 2, 3]),
            dtype: DType::Float32,
            shape: vec![8, 8],
        },
    );
    catalog.append_frame("r", synthetic_frame(8, 8, 2));
    catalog.set_stop("r");

    let events = run_driver(
        catalog,
        vec![
            Notification::RunStart {
                run_id: "r".to_string(),
            },
            Notification::NewFrame {
                run_id: "r".to_string(),
                frame_number: 2,
            },
            Notification::RunStop {
                run_id: "r".to_string(),
            },
        ],
    )
    .await;

    // Start, frames 0 and 2, then a Stop carrying the delivered count.
    assert!(matches!(&events[0], LifecycleEvent::Start(_)));
    assert!(matches!(&events[1], LifecycleEvent::Event(frame) if frame.frame_number == 0));
    assert!(matches!(&events[2], LifecycleEvent::Event(frame) if frame.frame_number == 2));
    match events.last() {
        Some(LifecycleEvent::Stop(stop)) => assert_eq!(stop.num_frames, 2),
        other => panic!("expected Stop last, got {other:?}"),
    }
    assert_eq!(events.len(), 4);
}
