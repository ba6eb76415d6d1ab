use crate::distance::Metric;
use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A decoded 3-channel RGB raster. Borrowed immutably for the duration of a verification call.
pub type Image = RgbImage;

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// A detected face: bounding box in image coordinates, detector confidence and optional landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

impl FaceRegion {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Compute backend a model session is bound to at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Accelerator,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Device::Cpu => "cpu",
            Device::Accelerator => "accelerator",
        })
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "accelerator" => Ok(Device::Accelerator),
            other => Err(format!("unknown device '{other}' (expected \"cpu\" or \"accelerator\")")),
        }
    }
}

/// Norm convention of the vectors a model emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingNorm {
    Raw,
    L2,
}

/// A face cropped, resized and pixel-normalized for one specific model.
///
/// NCHW tensor of shape `[1, 3, height, width]`.
#[derive(Debug, Clone)]
pub struct NormalizedFace {
    pub tensor: Array4<f32>,
    /// Identifier of the model whose input descriptor produced this tensor.
    pub model_id: String,
}

/// Identity embedding. Only comparable with embeddings from the same model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "vggface2").
    pub model_id: String,
    pub norm: EmbeddingNorm,
}

impl Embedding {
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

/// Outcome of a single `verify` call. Returned to the caller, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    /// `distance < threshold`.
    pub matched: bool,
    pub distance: f32,
    pub threshold: f32,
    /// Resolved model identifier (never the "default" alias).
    pub model_id: String,
    /// Metric actually used to score the pair.
    pub metric: Metric,
    /// Metric identifier as requested by the caller.
    pub requested_metric: String,
    /// True when `requested_metric` was not recognized and Euclidean was used instead.
    pub metric_fallback: bool,
    pub device: Device,
}
