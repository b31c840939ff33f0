//! Derived-event publishers.
//!
//! Any [`MessageSink<DerivedEvent>`] works as a publisher — the TCP
//! publisher fans out to live visualization clients, the bounded channel
//! wires stages in-process. This module adds the catalog write-back:
//! reduction results are appended to result arrays inside the catalog so a
//! run's curves and feature vectors live next to its raw frames.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::catalog::CatalogWriter;
use crate::channel::MessageSink;
use crate::error::ChannelError;
use crate::messages::DerivedEvent;

/// Result array key for 1-D reductions.
pub const ONE_D_KEY: &str = "one_d_reduction";
/// Result array key for latent-space vectors.
pub const LATENT_KEY: &str = "dim_reduction";

/// Appends derived events to the catalog, one row per frame.
///
/// Write failures are logged and the event dropped from the write-back
/// only — the catalog copy is a convenience mirror, and failing the whole
/// run for it would stall the live stream.
pub struct CatalogWriteBack {
    writer: Arc<dyn CatalogWriter>,
    current_run: Option<String>,
}

impl CatalogWriteBack {
    /// A write-back publisher over `writer`.
    pub fn new(writer: Arc<dyn CatalogWriter>) -> Self {
        Self {
            writer,
            current_run: None,
        }
    }

    async fn append(&self, key: &str, row: &[f32]) {
        let Some(run_id) = &self.current_run else {
            // Joined mid-run: no Start seen, nowhere to write.
            error!("no run node for result row; operator started after the start message");
            return;
        };
        if let Err(err) = self.writer.append_row(run_id, key, row).await {
            warn!(run_id = %run_id, key, error = %err, "result write-back failed");
        }
    }
}

#[async_trait]
impl MessageSink<DerivedEvent> for CatalogWriteBack {
    async fn send(&mut self, event: &DerivedEvent) -> Result<(), ChannelError> {
        match event {
            DerivedEvent::Start(start) => {
                match self.writer.create_result_run(start).await {
                    Ok(()) => self.current_run = Some(start.run_id.clone()),
                    Err(err) => {
                        warn!(run_id = %start.run_id, error = %err, "could not create result run");
                        self.current_run = None;
                    }
                }
            }
            DerivedEvent::OneDReduction(curve) => {
                self.append(ONE_D_KEY, &curve.intensity).await;
            }
            DerivedEvent::LatentSpace(latent) => {
                self.append(LATENT_KEY, &latent.feature_vector).await;
            }
            DerivedEvent::Stop(stop) => {
                debug!(num_frames = stop.num_frames, "run write-back finished");
                self.current_run = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::mock::MockCatalog;
    use crate::messages::{CurveEvent, LatentSpaceEvent, StartEvent, StopEvent};

    fn start(run_id: &str) -> DerivedEvent {
        DerivedEvent::Start(StartEvent {
            run_name: "scan".to_string(),
            run_id: run_id.to_string(),
            width: 0,
            height: 0,
            data_type: String::new(),
            source_locator: String::new(),
        })
    }

    #[tokio::test]
    async fn test_rows_land_in_the_catalog() {
        let catalog = MockCatalog::new();
        let mut writeback = CatalogWriteBack::new(Arc::new(catalog.clone()));

        writeback.send(&start("r1")).await.unwrap();
        writeback
            .send(&DerivedEvent::OneDReduction(CurveEvent {
                frame_number: 0,
                q: vec![1.0, 2.0],
                intensity: vec![10.0, 20.0],
            }))
            .await
            .unwrap();
        writeback
            .send(&DerivedEvent::LatentSpace(LatentSpaceEvent {
                frame_number: 0,
                feature_vector: vec![0.5, 0.25],
            }))
            .await
            .unwrap();
        writeback
            .send(&DerivedEvent::Stop(StopEvent {
                num_frames: 1,
                aborted: false,
            }))
            .await
            .unwrap();

        assert_eq!(catalog.result_rows("r1", ONE_D_KEY), vec![vec![10.0, 20.0]]);
        assert_eq!(catalog.result_rows("r1", LATENT_KEY), vec![vec![0.5, 0.25]]);
    }

    #[tokio::test]
    async fn test_rows_without_start_are_dropped_loudly() {
        let catalog = MockCatalog::new();
        let mut writeback = CatalogWriteBack::new(Arc::new(catalog.clone()));
        // No Start seen; the row has nowhere to go but the sink stays up.
        writeback
            .send(&DerivedEvent::OneDReduction(CurveEvent {
                frame_number: 0,
                q: vec![1.0],
                intensity: vec![1.0],
            }))
            .await
            .unwrap();
        assert!(catalog.result_rows("r1", ONE_D_KEY).is_empty());
    }
}
