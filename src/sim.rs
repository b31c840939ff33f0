//! Simulated acquisition.
//!
//! Drives a [`MockCatalog`] the way a beamline writes a real one: create a
//! run, append frames at a fixed rate, write the stop document, pause,
//! repeat. Used by the `simulate` subcommand and the integration tests so
//! the whole pipeline can be exercised without a detector.

use std::time::Duration;

use rand::Rng;
use tracing::info;
use uuid::Uuid;

use crate::catalog::mock::MockCatalog;
use crate::error::AppResult;
use crate::messages::ImagePayload;
use crate::shutdown::ShutdownSignal;

/// Tunables for the simulated acquisition.
#[derive(Clone, Debug)]
pub struct SimOptions {
    /// Number of runs to produce.
    pub runs: u32,
    /// Frames per run.
    pub frames_per_run: u32,
    /// Time between frames.
    pub frame_interval: Duration,
    /// Pause between the stop document and the next run.
    pub run_pause: Duration,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            runs: 3,
            frames_per_run: 20,
            frame_interval: Duration::from_millis(200),
            run_pause: Duration::from_secs(1),
            width: 128,
            height: 128,
        }
    }
}

/// A scattering-ring pattern that drifts with the frame number, plus shot
/// noise, so reduced curves visibly evolve over a run.
pub fn synthetic_frame(width: u32, height: u32, frame_number: u64) -> ImagePayload {
    let mut rng = rand::thread_rng();
    let center_row = (height as f64 - 1.0) / 2.0;
    let center_col = (width as f64 - 1.0) / 2.0;
    let ring_radius = 0.15 * width.min(height) as f64 + frame_number as f64 * 0.5;
    let ring_width = 3.0;

    let mut values = Vec::with_capacity((width * height) as usize);
    for row in 0..height {
        for col in 0..width {
            let dr = row as f64 - center_row;
            let dc = col as f64 - center_col;
            let radius = (dr * dr + dc * dc).sqrt();
            let ring = (-((radius - ring_radius) / ring_width).powi(2)).exp();
            let value = 1000.0 * ring + rng.gen_range(0.0..20.0);
            values.push(value as f32);
        }
    }
    ImagePayload::from_pixels(vec![height, width], &values)
}

/// The acquisition task.
pub struct AcquisitionSim {
    catalog: MockCatalog,
    options: SimOptions,
}

impl AcquisitionSim {
    /// A simulation writing into `catalog`.
    pub fn new(catalog: MockCatalog, options: SimOptions) -> Self {
        Self { catalog, options }
    }

    /// Produce the configured runs, observing shutdown between frames.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> AppResult<()> {
        for run_index in 0..self.options.runs {
            if shutdown.is_shutdown() {
                break;
            }
            let run_id = Uuid::new_v4().simple().to_string();
            let run_name = format!("sim_scan_{run_index:03}");
            info!(run_id = %run_id, run_name = %run_name, "simulated run starting");
            self.catalog.create_run(&run_id, &run_name);

            for frame_number in 0..self.options.frames_per_run {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(self.options.frame_interval) => {
                        self.catalog.append_frame(
                            &run_id,
                            synthetic_frame(
                                self.options.width,
                                self.options.height,
                                u64::from(frame_number),
                            ),
                        );
                    }
                }
            }
            self.catalog.set_stop(&run_id);
            info!(run_id = %run_id, "simulated run stopped");

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.options.run_pause) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RunCatalog;
    use crate::shutdown;

    #[test]
    fn test_synthetic_frame_shape_and_dtype() {
        let frame = synthetic_frame(16, 8, 0);
        assert_eq!(frame.shape, vec![8, 16]);
        assert!(frame.is_well_formed());
        assert_eq!(frame.dtype.as_str(), "float32");
    }

    #[tokio::test]
    async fn test_sim_writes_runs_and_stop_documents() {
        let catalog = MockCatalog::new();
        let options = SimOptions {
            runs: 2,
            frames_per_run: 3,
            frame_interval: Duration::from_millis(1),
            run_pause: Duration::from_millis(1),
            width: 8,
            height: 8,
        };
        AcquisitionSim::new(catalog.clone(), options)
            .run(shutdown::ShutdownSignal::never())
            .await
            .unwrap();

        let recent = catalog.most_recent_run().await.unwrap().unwrap();
        assert!(recent.has_stop);
        assert_eq!(catalog.frame_count(&recent.run_id, &[]).await.unwrap(), 3);
    }
}
