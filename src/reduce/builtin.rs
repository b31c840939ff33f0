//! Built-in reference reducers.

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::messages::ImagePayload;

use super::{FrameReducer, ReducedArtifact};

fn image_as_f64(image: &ImagePayload) -> Result<(Vec<f64>, usize, usize)> {
    let values = image
        .to_f64_vec()
        .ok_or_else(|| anyhow!("image bytes do not match declared shape"))?;
    let height = image.shape.first().copied().unwrap_or(0) as usize;
    let width = image.shape.get(1).copied().unwrap_or(0) as usize;
    if height == 0 || width == 0 {
        return Err(anyhow!("degenerate image shape {:?}", image.shape));
    }
    Ok((values, height, width))
}

/// Configuration for [`MeanPoolReducer`].
#[derive(Clone, Debug, Deserialize)]
pub struct MeanPoolConfig {
    /// The image is pooled onto a `grid x grid` lattice.
    #[serde(default = "default_grid")]
    pub grid: usize,
}

fn default_grid() -> usize {
    8
}

/// Block-pooled feature vector: the image is divided into `grid x grid`
/// blocks and each block's mean intensity becomes one vector component.
///
/// A stand-in latent-space encoder with the same interface shape as a
/// learned model: fixed output length, content-sensitive, cheap.
pub struct MeanPoolReducer {
    grid: usize,
}

impl MeanPoolReducer {
    /// Build from config.
    pub fn new(config: MeanPoolConfig) -> Result<Self> {
        if config.grid == 0 {
            return Err(anyhow!("grid must be at least 1"));
        }
        Ok(Self { grid: config.grid })
    }
}

impl FrameReducer for MeanPoolReducer {
    fn reduce(&self, image: &ImagePayload) -> Result<ReducedArtifact> {
        let (values, height, width) = image_as_f64(image)?;
        let grid = self.grid;
        let mut sums = vec![0.0f64; grid * grid];
        let mut counts = vec![0u64; grid * grid];
        for row in 0..height {
            let cell_row = row * grid / height;
            for col in 0..width {
                let cell_col = col * grid / width;
                let cell = cell_row * grid + cell_col;
                sums[cell] += values[row * width + col];
                counts[cell] += 1;
            }
        }
        let vector = sums
            .iter()
            .zip(&counts)
            .map(|(&sum, &count)| {
                if count == 0 {
                    0.0
                } else {
                    (sum / count as f64) as f32
                }
            })
            .collect();
        Ok(ReducedArtifact::FeatureVector(vector))
    }
}

/// Configuration for [`RadialProfileReducer`].
#[derive(Clone, Debug, Deserialize)]
pub struct RadialProfileConfig {
    /// Number of radial bins in the profile.
    #[serde(default = "default_bins")]
    pub bins: usize,
}

fn default_bins() -> usize {
    100
}

/// Azimuthally averaged 1-D profile around the image center.
///
/// Pixels are binned by their distance from the center and each bin's mean
/// intensity reported against a pixel-unit radius axis. Beam-center
/// refinement, masking and ROI cuts are deliberately out of scope.
pub struct RadialProfileReducer {
    bins: usize,
}

impl RadialProfileReducer {
    /// Build from config.
    pub fn new(config: RadialProfileConfig) -> Result<Self> {
        if config.bins == 0 {
            return Err(anyhow!("bins must be at least 1"));
        }
        Ok(Self { bins: config.bins })
    }
}

impl FrameReducer for RadialProfileReducer {
    fn reduce(&self, image: &ImagePayload) -> Result<ReducedArtifact> {
        let (values, height, width) = image_as_f64(image)?;
        let center_row = (height as f64 - 1.0) / 2.0;
        let center_col = (width as f64 - 1.0) / 2.0;
        let max_radius = (center_row * center_row + center_col * center_col).sqrt();
        let bin_width = (max_radius / self.bins as f64).max(f64::MIN_POSITIVE);

        let mut sums = vec![0.0f64; self.bins];
        let mut counts = vec![0u64; self.bins];
        for row in 0..height {
            let dr = row as f64 - center_row;
            for col in 0..width {
                let dc = col as f64 - center_col;
                let radius = (dr * dr + dc * dc).sqrt();
                let bin = ((radius / bin_width) as usize).min(self.bins - 1);
                sums[bin] += values[row * width + col];
                counts[bin] += 1;
            }
        }
        let q = (0..self.bins)
            .map(|bin| ((bin as f64 + 0.5) * bin_width) as f32)
            .collect();
        let intensity = sums
            .iter()
            .zip(&counts)
            .map(|(&sum, &count)| {
                if count == 0 {
                    0.0
                } else {
                    (sum / count as f64) as f32
                }
            })
            .collect();
        Ok(ReducedArtifact::Curve { q, intensity })
    }
}
