//! The run catalog boundary.
//!
//! The catalog is an external collaborator: a hierarchical, path-addressable
//! store of runs, each holding streams of array nodes plus start/stop
//! metadata documents. The pipeline consumes it read-only through
//! [`RunCatalog`] and writes reduction results back through
//! [`CatalogWriter`]. The catalog handle is shared as `Arc<dyn RunCatalog>`
//! across driver instances.
//!
//! Two implementations ship with the crate: [`mock::MockCatalog`], an
//! in-memory catalog for tests and simulated acquisition, and
//! [`http::HttpCatalog`], a client for a Tiled-style REST catalog server.

pub mod http;
pub mod mock;

use async_trait::async_trait;

use crate::error::CatalogError;
use crate::messages::{DType, ImagePayload, StartEvent};

/// Read-only description of one run as the catalog currently exposes it.
///
/// The catalog owns the run; this value is a snapshot. Frame counts grow
/// monotonically until `has_stop` becomes true.
#[derive(Clone, Debug, PartialEq)]
pub struct RunInfo {
    /// Stable unique identifier.
    pub run_id: String,
    /// Human-readable label; may repeat across experiments.
    pub run_name: String,
    /// Opaque catalog locator for the run.
    pub uri: String,
    /// `(width, height)` of the frame stack, when the catalog can report it.
    pub frame_shape: Option<(u32, u32)>,
    /// Element type of the frame stack, when the catalog can report it.
    pub data_type: Option<DType>,
    /// True once the acquisition has finished writing.
    pub has_stop: bool,
}

impl RunInfo {
    /// Build the Start message for this run.
    ///
    /// Unknown structure maps to zero dimensions and an empty dtype string;
    /// consumers resolve those from the first frame.
    pub fn start_event(&self) -> StartEvent {
        let (width, height) = self.frame_shape.unwrap_or((0, 0));
        StartEvent {
            run_name: self.run_name.clone(),
            run_id: self.run_id.clone(),
            width,
            height,
            data_type: self.data_type.map(|d| d.as_str().to_string()).unwrap_or_default(),
            source_locator: self.uri.clone(),
        }
    }
}

/// Query interface onto the catalog.
///
/// `segments` is the path of the designated frame-stream node inside a run,
/// e.g. `["primary", "data", "pil2M_image"]`.
#[async_trait]
pub trait RunCatalog: Send + Sync {
    /// The most recently created run, if the catalog holds any.
    async fn most_recent_run(&self) -> Result<Option<RunInfo>, CatalogError>;

    /// Look up one run by id.
    async fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>, CatalogError>;

    /// Current length of the run's frame stack.
    async fn frame_count(&self, run_id: &str, segments: &[String]) -> Result<u64, CatalogError>;

    /// Read one frame slice out of the run's frame stack.
    async fn read_frame(
        &self,
        run_id: &str,
        segments: &[String],
        index: u64,
    ) -> Result<ImagePayload, CatalogError>;
}

/// Write-back interface for publishing reduction results into the catalog.
#[async_trait]
pub trait CatalogWriter: Send + Sync {
    /// Ensure a result container exists for the run described by `start`.
    async fn create_result_run(&self, start: &StartEvent) -> Result<(), CatalogError>;

    /// Append one row to the named result array of a run, extending it.
    async fn append_row(&self, run_id: &str, key: &str, row: &[f32]) -> Result<(), CatalogError>;
}

/// Render a frame-node path for logging and `source_locator` fields.
pub fn node_path(run_id: &str, segments: &[String]) -> String {
    let mut path = run_id.to_string();
    for segment in segments {
        path.push('/');
        path.push_str(segment);
    }
    path
}
