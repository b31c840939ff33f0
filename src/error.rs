//! Error types for the pipeline.
//!
//! Each subsystem gets its own `thiserror` enum so callers can react to the
//! class of failure rather than string-matching messages:
//!
//! - [`CatalogError`]: failures talking to the run catalog. The driver loops
//!   need to distinguish transient transport faults (keep state, retry next
//!   cycle) from malformed data (skip the frame) — see
//!   [`CatalogError::is_transient`].
//! - [`ChannelError`]: failures on the message channel, including wire
//!   encode/decode errors.
//! - [`PipelineError`]: the application-level error, converting from the
//!   others via `#[from]` so `?` works throughout.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PipelineError>;

/// Errors raised by [`RunCatalog`](crate::catalog::RunCatalog) implementations.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The catalog could not be reached or the request failed in transit.
    #[error("catalog transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// I/O failure below the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested run does not exist in the catalog.
    #[error("run '{0}' not found")]
    RunNotFound(String),

    /// A node exists but its structure is not what the pipeline expects.
    #[error("malformed catalog node '{node}': {reason}")]
    MalformedNode {
        /// Path of the offending node.
        node: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A frame index beyond the node's current length was requested.
    #[error("frame {index} out of range for node '{node}'")]
    FrameOutOfRange {
        /// Path of the array node.
        node: String,
        /// The requested index.
        index: u64,
    },
}

impl CatalogError {
    /// Whether retrying the same request later can reasonably succeed.
    ///
    /// Transient errors never terminate a driver loop; sequencing state is
    /// kept and the fetch is retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Transport(_) | CatalogError::Io(_) => true,
            // A not-yet-visible frame can appear on the next poll.
            CatalogError::FrameOutOfRange { .. } => true,
            CatalogError::RunNotFound(_) | CatalogError::MalformedNode { .. } => false,
        }
    }
}

/// Errors raised by message channel implementations.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("wire encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("wire decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer or the in-process receiver is gone.
    #[error("channel closed")]
    Closed,

    /// A send failed and the retry policy gave up.
    #[error("send retries exhausted after {0} attempts")]
    RetriesExhausted(u32),
}

/// Top-level application error.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Semantic configuration problems caught during validation.
    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("reduction error: {0}")]
    Reduction(String),
}
