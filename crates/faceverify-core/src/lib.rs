//! faceverify-core — Face verification engine.
//!
//! Detects a face in each of two images (SCRFD), normalizes it for the
//! selected embedding backbone (VGGFace2 or ArcFace, via ONNX Runtime),
//! embeds it, scores the pair under a distance metric and compares the
//! score against a calibrated per-(model, metric) threshold.

pub mod alignment;
pub mod config;
pub mod decode;
pub mod detector;
pub mod distance;
pub mod normalizer;
pub mod recognizer;
pub mod registry;
mod session;
pub mod thresholds;
pub mod types;
pub mod verify;

#[cfg(test)]
mod testing;

pub use config::{default_model_dir, Config, ConfigError};
pub use decode::{decode_image, load_image, DecodeError};
pub use detector::{select_best, DetectorConfig, DetectorError, FaceLocator, ScrfdLocator};
pub use distance::{distance, DistanceError, Metric, UnsupportedMetric};
pub use normalizer::{normalize, NormalizeError};
pub use recognizer::{EmbeddingModel, ModelDescriptor, ModelVariant, OnnxEmbedder, RecognizerError};
pub use registry::{ModelError, ModelRegistry};
pub use thresholds::{ThresholdError, ThresholdRegistry};
pub use types::{Device, Embedding, EmbeddingNorm, FaceRegion, Image, NormalizedFace, VerificationResult};
pub use verify::{ContextError, ImageSide, Stage, Verifier, VerifyError, DEFAULT_METRIC, DEFAULT_MODEL};
