//! An in-memory catalog for tests and simulated acquisition.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::CatalogError;
use crate::messages::{ImagePayload, StartEvent};

use super::{node_path, CatalogWriter, RunCatalog, RunInfo};

#[derive(Debug, Default)]
struct MockRun {
    run_name: String,
    frames: Vec<ImagePayload>,
    has_stop: bool,
    results: HashMap<String, Vec<Vec<f32>>>,
}

#[derive(Debug, Default)]
struct Inner {
    // Creation order; the last entry is the most recent run.
    order: Vec<String>,
    runs: HashMap<String, MockRun>,
}

/// A process-local catalog backed by a `HashMap`.
///
/// Cloning yields another handle onto the same store, so a simulated
/// acquisition task can append frames while a driver polls.
#[derive(Clone, Debug, Default)]
pub struct MockCatalog {
    inner: Arc<RwLock<Inner>>,
}

impl MockCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new run, making it the most recent one.
    pub fn create_run(&self, run_id: &str, run_name: &str) {
        let mut inner = self.write();
        inner.order.push(run_id.to_string());
        inner.runs.insert(
            run_id.to_string(),
            MockRun {
                run_name: run_name.to_string(),
                ..MockRun::default()
            },
        );
    }

    /// Append one frame to a run's frame stack.
    pub fn append_frame(&self, run_id: &str, frame: ImagePayload) {
        if let Some(run) = self.write().runs.get_mut(run_id) {
            run.frames.push(frame);
        }
    }

    /// Write the stop document for a run.
    pub fn set_stop(&self, run_id: &str) {
        if let Some(run) = self.write().runs.get_mut(run_id) {
            run.has_stop = true;
        }
    }

    /// Rows appended to a result array via [`CatalogWriter`], for assertions.
    pub fn result_rows(&self, run_id: &str, key: &str) -> Vec<Vec<f32>> {
        self.read()
            .runs
            .get(run_id)
            .and_then(|run| run.results.get(key).cloned())
            .unwrap_or_default()
    }

    fn info(&self, run_id: &str, run: &MockRun) -> RunInfo {
        let structure = run.frames.first().map(|f| {
            let height = f.shape.first().copied().unwrap_or(0);
            let width = f.shape.get(1).copied().unwrap_or(0);
            ((width, height), f.dtype)
        });
        RunInfo {
            run_id: run_id.to_string(),
            run_name: run.run_name.clone(),
            uri: format!("mock://{run_id}"),
            frame_shape: structure.map(|(shape, _)| shape),
            data_type: structure.map(|(_, dtype)| dtype),
            has_stop: run.has_stop,
        }
    }

    // Lock poisoning only happens after a panic elsewhere; propagating the
    // panic is fine for a test/sim catalog.
    #[allow(clippy::unwrap_used)]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap()
    }

    #[allow(clippy::unwrap_used)]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap()
    }
}

#[async_trait]
impl RunCatalog for MockCatalog {
    async fn most_recent_run(&self) -> Result<Option<RunInfo>, CatalogError> {
        let inner = self.read();
        Ok(inner
            .order
            .last()
            .and_then(|id| inner.runs.get(id).map(|run| self.info(id, run))))
    }

    async fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>, CatalogError> {
        let inner = self.read();
        Ok(inner.runs.get(run_id).map(|run| self.info(run_id, run)))
    }

    async fn frame_count(&self, run_id: &str, _segments: &[String]) -> Result<u64, CatalogError> {
        let inner = self.read();
        inner
            .runs
            .get(run_id)
            .map(|run| run.frames.len() as u64)
            .ok_or_else(|| CatalogError::RunNotFound(run_id.to_string()))
    }

    async fn read_frame(
        &self,
        run_id: &str,
        segments: &[String],
        index: u64,
    ) -> Result<ImagePayload, CatalogError> {
        let inner = self.read();
        let run = inner
            .runs
            .get(run_id)
            .ok_or_else(|| CatalogError::RunNotFound(run_id.to_string()))?;
        run.frames
            .get(index as usize)
            .cloned()
            .ok_or_else(|| CatalogError::FrameOutOfRange {
                node: node_path(run_id, segments),
                index,
            })
    }
}

#[async_trait]
impl CatalogWriter for MockCatalog {
    async fn create_result_run(&self, start: &StartEvent) -> Result<(), CatalogError> {
        let mut inner = self.write();
        if !inner.runs.contains_key(&start.run_id) {
            inner.order.push(start.run_id.clone());
            inner.runs.insert(
                start.run_id.clone(),
                MockRun {
                    run_name: start.run_name.clone(),
                    ..MockRun::default()
                },
            );
        }
        Ok(())
    }

    async fn append_row(&self, run_id: &str, key: &str, row: &[f32]) -> Result<(), CatalogError> {
        let mut inner = self.write();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| CatalogError::RunNotFound(run_id.to_string()))?;
        run.results
            .entry(key.to_string())
            .or_default()
            .push(row.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DType;

    fn frame() -> ImagePayload {
        ImagePayload::from_pixels(vec![2, 2], &[1u16, 2, 3, 4])
    }

    #[tokio::test]
    async fn test_most_recent_run_tracks_creation_order() {
        let catalog = MockCatalog::new();
        assert!(catalog.most_recent_run().await.unwrap().is_none());

        catalog.create_run("a", "first");
        catalog.create_run("b", "second");
        let recent = catalog.most_recent_run().await.unwrap().unwrap();
        assert_eq!(recent.run_id, "b");
        assert!(!recent.has_stop);
    }

    #[tokio::test]
    async fn test_structure_comes_from_first_frame() {
        let catalog = MockCatalog::new();
        catalog.create_run("a", "scan");
        let info = catalog.run_info("a").await.unwrap().unwrap();
        assert_eq!(info.frame_shape, None);

        catalog.append_frame("a", frame());
        let info = catalog.run_info("a").await.unwrap().unwrap();
        assert_eq!(info.frame_shape, Some((2, 2)));
        assert_eq!(info.data_type, Some(DType::Uint16));
    }

    #[tokio::test]
    async fn test_read_frame_out_of_range() {
        let catalog = MockCatalog::new();
        catalog.create_run("a", "scan");
        catalog.append_frame("a", frame());
        let err = catalog.read_frame("a", &[], 5).await.unwrap_err();
        assert!(matches!(err, CatalogError::FrameOutOfRange { index: 5, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_result_rows_append() {
        let catalog = MockCatalog::new();
        catalog.create_run("a", "scan");
        catalog.append_row("a", "one_d_reduction", &[1.0, 2.0]).await.unwrap();
        catalog.append_row("a", "one_d_reduction", &[3.0, 4.0]).await.unwrap();
        assert_eq!(
            catalog.result_rows("a", "one_d_reduction"),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
    }
}
