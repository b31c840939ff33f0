//! Frame reduction.
//!
//! Reducers are external collaborators from the pipeline's point of view: a
//! pure function from one image to a derived artifact. The crate ships two
//! reference reducers (block-pooled feature vectors and a radial 1-D
//! profile) and a name-keyed [`registry::ReducerRegistry`] so the one to
//! run is picked by configuration, not by scanning for implementations.
//!
//! CPU-bound reduction never runs on the event loop; the
//! [`operator::ReductionOperator`] offloads each frame to the blocking
//! thread pool.

pub mod builtin;
pub mod operator;
pub mod registry;

use anyhow::Result;

use crate::messages::ImagePayload;

/// What a reducer produced for one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ReducedArtifact {
    /// A 1-D scattering curve.
    Curve {
        /// Scattering-vector axis.
        q: Vec<f32>,
        /// Intensity per `q` bin.
        intensity: Vec<f32>,
    },
    /// A latent-space feature vector.
    FeatureVector(Vec<f32>),
}

/// A pure transform from one frame to a derived artifact.
pub trait FrameReducer: Send + Sync {
    /// Reduce one image.
    fn reduce(&self, image: &ImagePayload) -> Result<ReducedArtifact>;
}
