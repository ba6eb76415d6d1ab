//! Verification Orchestrator: two images in, one thresholded decision out.
//!
//! Linear pipeline, each stage aborting on failure:
//! DETECT → SELECT → NORMALIZE → EMBED (per image) → SCORE → DECIDE.

use crate::config::{Config, ConfigError};
use crate::detector::{select_best, DetectorError, FaceLocator, ScrfdLocator};
use crate::distance::{DistanceError, Metric};
use crate::normalizer::{self, NormalizeError};
use crate::recognizer::{EmbeddingModel, RecognizerError};
use crate::registry::{ModelError, ModelRegistry};
use crate::thresholds::{ThresholdError, ThresholdRegistry};
use crate::types::{Embedding, FaceRegion, Image, VerificationResult};
use std::fmt;
use thiserror::Error;

/// Model identifier used when the caller names none.
pub const DEFAULT_MODEL: &str = crate::registry::DEFAULT_MODEL_ALIAS;
/// Metric identifier used when the caller names none.
pub const DEFAULT_METRIC: &str = "euclidean";

/// Pipeline stage an error originated in. SELECT cannot fail on its own:
/// an empty candidate list is reported as a DETECT failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detect,
    Normalize,
    Embed,
    Score,
    Decide,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Detect => "detect",
            Stage::Normalize => "normalize",
            Stage::Embed => "embed",
            Stage::Score => "score",
            Stage::Decide => "decide",
        })
    }
}

/// Which of the two inputs a per-image failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSide {
    First,
    Second,
}

impl fmt::Display for ImageSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageSide::First => "first",
            ImageSide::Second => "second",
        })
    }
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("no face detected in {0} image")]
    NoFaceDetected(ImageSide),
    #[error("face detection failed on {side} image: {source}")]
    Detection {
        side: ImageSide,
        #[source]
        source: DetectorError,
    },
    #[error("invalid face region in {side} image: {source}")]
    InvalidRegion {
        side: ImageSide,
        #[source]
        source: NormalizeError,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("embedding failed on {side} image: {source}")]
    Embedding {
        side: ImageSide,
        #[source]
        source: RecognizerError,
    },
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("embeddings come from different models: '{left}' vs '{right}'")]
    ModelMismatch { left: String, right: String },
    #[error("no threshold defined for model '{model}' with metric '{metric}'")]
    NoThresholdDefined { model: String, metric: Metric },
}

impl VerifyError {
    pub fn stage(&self) -> Stage {
        match self {
            VerifyError::NoFaceDetected(_) | VerifyError::Detection { .. } => Stage::Detect,
            VerifyError::InvalidRegion { .. } => Stage::Normalize,
            VerifyError::Model(_) | VerifyError::Embedding { .. } => Stage::Embed,
            VerifyError::DimensionMismatch { .. } | VerifyError::ModelMismatch { .. } => Stage::Score,
            VerifyError::NoThresholdDefined { .. } => Stage::Decide,
        }
    }

    /// The input image a per-image failure refers to.
    pub fn side(&self) -> Option<ImageSide> {
        match self {
            VerifyError::NoFaceDetected(side)
            | VerifyError::Detection { side, .. }
            | VerifyError::InvalidRegion { side, .. }
            | VerifyError::Embedding { side, .. } => Some(*side),
            _ => None,
        }
    }
}

impl From<DistanceError> for VerifyError {
    fn from(e: DistanceError) -> Self {
        match e {
            DistanceError::DimensionMismatch { left, right } => VerifyError::DimensionMismatch { left, right },
            DistanceError::ModelMismatch { left, right } => VerifyError::ModelMismatch { left, right },
        }
    }
}

/// Failure while building the process-wide verification context.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("face locator: {0}")]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error("threshold table has no entry for: {}", format_pairs(.0))]
    IncompleteThresholds(Vec<(String, Metric)>),
}

fn format_pairs(pairs: &[(String, Metric)]) -> String {
    pairs
        .iter()
        .map(|(model, metric)| format!("{model}/{metric}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Process-wide verification context: built once, then shared read-only.
pub struct Verifier {
    locator: Box<dyn FaceLocator>,
    models: ModelRegistry,
    thresholds: ThresholdRegistry,
    padding: f32,
}

impl Verifier {
    pub fn new(
        locator: Box<dyn FaceLocator>,
        models: ModelRegistry,
        thresholds: ThresholdRegistry,
        padding: f32,
    ) -> Self {
        Self { locator, models, thresholds, padding }
    }

    /// Load the locator, models and thresholds named by `config`.
    ///
    /// Fails unless every loaded model has a threshold for every metric.
    pub fn from_config(config: &Config) -> Result<Self, ContextError> {
        config.validate()?;

        let locator = ScrfdLocator::load(&config.detector_model_path(), config.device, config.detector.clone())?;
        let models = ModelRegistry::load(&config.model_dir, &config.model_ids(), &config.default_model_id(), config.device)?;

        let mut thresholds = ThresholdRegistry::builtin()?;
        if let Some(path) = &config.thresholds {
            thresholds.merge(ThresholdRegistry::from_path(path)?);
        }

        let verifier = Self::new(Box::new(locator), models, thresholds, config.padding);
        let missing = verifier.missing_thresholds();
        if !missing.is_empty() {
            return Err(ContextError::IncompleteThresholds(missing));
        }

        tracing::info!(
            device = %config.device,
            default_model = %verifier.models.default_id(),
            models = ?verifier.models.ids().collect::<Vec<_>>(),
            padding = config.padding,
            "verification context ready"
        );
        Ok(verifier)
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn thresholds(&self) -> &ThresholdRegistry {
        &self.thresholds
    }

    /// Loaded (model, metric) combinations with no calibrated threshold.
    pub fn missing_thresholds(&self) -> Vec<(String, Metric)> {
        self.thresholds.missing(self.models.ids())
    }

    /// Run only the Face Locator.
    pub fn detect(&self, image: &Image) -> Result<Vec<FaceRegion>, DetectorError> {
        self.locator.detect(image)
    }

    /// Decide whether `first` and `second` show the same person.
    ///
    /// An unrecognized `metric_id` falls back to Euclidean and is flagged in
    /// the result; every other failure aborts with the stage that raised it.
    pub fn verify(
        &self,
        first: &Image,
        second: &Image,
        model_id: &str,
        metric_id: &str,
    ) -> Result<VerificationResult, VerifyError> {
        let model = self.models.get(model_id)?;
        let descriptor = model.descriptor();
        let (metric, metric_fallback) = Metric::resolve(metric_id);

        let a = self.embed_image(first, ImageSide::First, model.as_ref())?;
        let b = self.embed_image(second, ImageSide::Second, model.as_ref())?;

        let distance = a.distance_to(&b, metric)?;

        let threshold = self
            .thresholds
            .lookup(&descriptor.id, metric)
            .map_err(|_| VerifyError::NoThresholdDefined { model: descriptor.id.clone(), metric })?;
        let matched = distance < threshold;

        tracing::info!(
            model = %descriptor.id,
            %metric,
            metric_fallback,
            distance,
            threshold,
            matched,
            "verification decided"
        );

        Ok(VerificationResult {
            matched,
            distance,
            threshold,
            model_id: descriptor.id.clone(),
            metric,
            requested_metric: metric_id.to_string(),
            metric_fallback,
            device: descriptor.device,
        })
    }

    /// DETECT → SELECT → NORMALIZE → EMBED for one image.
    fn embed_image(&self, image: &Image, side: ImageSide, model: &dyn EmbeddingModel) -> Result<Embedding, VerifyError> {
        let regions = self
            .locator
            .detect(image)
            .map_err(|source| VerifyError::Detection { side, source })?;

        let region = select_best(&regions).ok_or(VerifyError::NoFaceDetected(side))?;
        tracing::debug!(
            %side,
            candidates = regions.len(),
            confidence = region.confidence,
            x = region.x,
            y = region.y,
            "face selected"
        );

        let face = normalizer::normalize(image, region, model.descriptor(), self.padding)
            .map_err(|source| VerifyError::InvalidRegion { side, source })?;

        model.embed(&face).map_err(|source| VerifyError::Embedding { side, source })
    }
}
