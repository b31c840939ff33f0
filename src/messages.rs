//! Message types exchanged across the pipeline.
//!
//! Three families of messages flow through the system:
//!
//! - [`LifecycleEvent`]: the raw-frame stream produced by a delivery driver.
//!   Exactly one `Start` precedes the first `Frame` of a run, and exactly one
//!   `Stop` follows the last one. Events from two runs never interleave on
//!   one channel.
//! - [`DerivedEvent`]: reduction results republished downstream (1-D curves
//!   and latent-space feature vectors), bracketed by the same Start/Stop.
//! - [`Notification`]: the push-mode control messages received from a
//!   catalog notification service.
//!
//! # Wire format
//!
//! Lifecycle and derived events are encoded as field-name-keyed MessagePack
//! maps ([`encode`]/[`decode`]), with image payloads carried as raw
//! little-endian bytes plus an explicit dtype string and shape so that a
//! round trip is byte-identical. Notifications are plain JSON, one object
//! per line on the notification connection.
//!
//! # Unknown structure at start time
//!
//! A `Start` may be emitted before the catalog can report the run's array
//! structure (push mode observes the run document first). `width == 0`,
//! `height == 0` or an empty `data_type` mean "unknown"; consumers take the
//! authoritative shape and dtype from the first `Frame`.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ChannelError;

/// Element type of an image payload, spelled the way the catalog spells it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 8-bit unsigned integer pixels.
    Uint8,
    /// 16-bit unsigned integer pixels.
    Uint16,
    /// 32-bit signed integer pixels.
    Int32,
    /// 32-bit unsigned integer pixels.
    Uint32,
    /// 32-bit float pixels.
    Float32,
    /// 64-bit float pixels.
    Float64,
}

impl DType {
    /// Bytes per element.
    pub fn byte_size(&self) -> usize {
        match self {
            DType::Uint8 => 1,
            DType::Uint16 => 2,
            DType::Int32 | DType::Uint32 | DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }

    /// The catalog's string spelling of this dtype.
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Uint8 => "uint8",
            DType::Uint16 => "uint16",
            DType::Int32 => "int32",
            DType::Uint32 => "uint32",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    /// Parse the catalog's dtype string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uint8" => Some(DType::Uint8),
            "uint16" => Some(DType::Uint16),
            "int32" => Some(DType::Int32),
            "uint32" => Some(DType::Uint32),
            "float32" => Some(DType::Float32),
            "float64" => Some(DType::Float64),
            _ => None,
        }
    }
}

/// Pixel types that can be packed into an [`ImagePayload`].
pub trait Pixel: Copy {
    /// The dtype tag for this element type.
    const DTYPE: DType;
    /// Append this element to `out` in little-endian byte order.
    fn write_le(self, out: &mut Vec<u8>);
}

macro_rules! impl_pixel {
    ($ty:ty, $dtype:expr) => {
        impl Pixel for $ty {
            const DTYPE: DType = $dtype;
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_pixel!(u8, DType::Uint8);
impl_pixel!(u16, DType::Uint16);
impl_pixel!(i32, DType::Int32);
impl_pixel!(u32, DType::Uint32);
impl_pixel!(f32, DType::Float32);
impl_pixel!(f64, DType::Float64);

/// One 2-D detector image, immutable once constructed.
///
/// `data` holds row-major little-endian element bytes; `shape` is
/// `[height, width]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    /// Raw little-endian element bytes.
    pub data: Bytes,
    /// Element type of `data`.
    pub dtype: DType,
    /// Array shape, `[height, width]`.
    pub shape: Vec<u32>,
}

impl ImagePayload {
    /// Pack a slice of pixels into a payload.
    pub fn from_pixels<P: Pixel>(shape: Vec<u32>, values: &[P]) -> Self {
        let mut data = Vec::with_capacity(values.len() * P::DTYPE.byte_size());
        for v in values {
            v.write_le(&mut data);
        }
        Self {
            data: Bytes::from(data),
            dtype: P::DTYPE,
            shape,
        }
    }

    /// Number of elements implied by `shape`.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }

    /// Whether the byte length matches `shape` and `dtype`.
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.num_elements() * self.dtype.byte_size()
    }

    /// Decode the payload into `f64` values, converting from the native
    /// element type. Returns `None` when the byte length does not match the
    /// declared shape.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        if !self.is_well_formed() {
            return None;
        }
        let n = self.dtype.byte_size();
        let out = self
            .data
            .chunks_exact(n)
            .map(|c| match self.dtype {
                DType::Uint8 => c[0] as f64,
                DType::Uint16 => u16::from_le_bytes([c[0], c[1]]) as f64,
                DType::Int32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
                DType::Uint32 => u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
                DType::Float32 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
                DType::Float64 => {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                }
            })
            .collect();
        Some(out)
    }
}

/// Announces a new run. First event of every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartEvent {
    /// Human-readable run label; may repeat across experiments.
    pub run_name: String,
    /// Stable unique identifier of the run.
    pub run_id: String,
    /// Frame width in pixels; `0` when unknown at start time.
    pub width: u32,
    /// Frame height in pixels; `0` when unknown at start time.
    pub height: u32,
    /// Catalog dtype string; empty when unknown at start time.
    pub data_type: String,
    /// Opaque reference back to the catalog position.
    pub source_locator: String,
}

/// One delivered detector frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    /// Zero-based index of the frame within its run.
    pub frame_number: u64,
    /// The image payload.
    pub image: ImagePayload,
    /// Opaque reference back to the catalog position.
    pub source_locator: String,
}

/// Closes a run. Last event of every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopEvent {
    /// Number of frames actually delivered for the run.
    pub num_frames: u64,
    /// True when the run was superseded before its stop document arrived
    /// and `num_frames` is a partial count.
    #[serde(default)]
    pub aborted: bool,
}

/// The raw-frame event stream, tagged with `msg_type` on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Run opened.
    Start(StartEvent),
    /// One frame, wire tag `event`.
    Event(FrameEvent),
    /// Run closed.
    Stop(StopEvent),
}

impl LifecycleEvent {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Start(_) => "start",
            LifecycleEvent::Event(_) => "event",
            LifecycleEvent::Stop(_) => "stop",
        }
    }
}

/// A 1-D scattering curve reduced from one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurveEvent {
    /// Index of the source frame.
    pub frame_number: u64,
    /// Scattering-vector axis.
    pub q: Vec<f32>,
    /// Azimuthally averaged intensity per `q` bin.
    pub intensity: Vec<f32>,
}

/// A latent-space feature vector reduced from one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatentSpaceEvent {
    /// Index of the source frame.
    pub frame_number: u64,
    /// The encoded feature vector.
    pub feature_vector: Vec<f32>,
}

/// Reduction results republished downstream, tagged with `msg_type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum DerivedEvent {
    /// Run opened (forwarded unchanged from the raw stream).
    Start(StartEvent),
    /// 1-D reduction of one frame.
    OneDReduction(CurveEvent),
    /// Latent-space encoding of one frame.
    LatentSpace(LatentSpaceEvent),
    /// Run closed (forwarded unchanged from the raw stream).
    Stop(StopEvent),
}

/// Push-mode notification messages, JSON with a `type` tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A new run appeared in the catalog.
    RunStart {
        /// Identifier of the run.
        run_id: String,
    },
    /// A run's stop document was written.
    RunStop {
        /// Identifier of the run.
        run_id: String,
    },
    /// A frame became available.
    NewFrame {
        /// Identifier of the run.
        run_id: String,
        /// Index of the newly available frame.
        frame_number: u64,
    },
}

/// Encode a message as a field-name-keyed MessagePack map.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ChannelError> {
    Ok(Bytes::from(rmp_serde::to_vec_named(message)?))
}

/// Decode a message previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ChannelError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
