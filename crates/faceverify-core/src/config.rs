use crate::detector::DetectorConfig;
use crate::distance::Metric;
use crate::recognizer::ModelVariant;
use crate::types::Device;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Verification context configuration.
///
/// Layered as defaults → optional TOML file → `FACEVERIFY_*` environment
/// variables; the CLI applies its flags last.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Compute backend for every model session.
    pub device: Device,
    /// Fractional crop margin for the normalizer.
    pub padding: f32,
    /// Model the "default" alias resolves to.
    pub model: String,
    /// Metric used when the caller names none.
    pub metric: String,
    /// Directory holding the ONNX files.
    pub model_dir: PathBuf,
    /// Extra models to load next to `model`.
    pub preload: Vec<String>,
    /// Optional provisioning threshold table overlaid on the built-in one.
    pub thresholds: Option<PathBuf>,
    pub detector: DetectorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            padding: 1.0,
            model: ModelVariant::VggFace2.id().to_string(),
            metric: Metric::Euclidean.id().to_string(),
            model_dir: default_model_dir(),
            preload: Vec::new(),
            thresholds: None,
            detector: DetectorConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like `load`, reading overrides from `lookup` instead of the process environment.
    pub fn load_with(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml_str(&src)?
            }
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(src)?)
    }

    /// Apply `FACEVERIFY_*` overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("FACEVERIFY_DEVICE") {
            self.device = v.parse().map_err(|reason| ConfigError::Invalid { key: "FACEVERIFY_DEVICE", reason })?;
        }
        if let Some(v) = lookup("FACEVERIFY_PADDING") {
            self.padding = v.trim().parse().map_err(|e| ConfigError::Invalid {
                key: "FACEVERIFY_PADDING",
                reason: format!("{v:?}: {e}"),
            })?;
        }
        if let Some(v) = lookup("FACEVERIFY_MODEL") {
            self.model = v;
        }
        if let Some(v) = lookup("FACEVERIFY_METRIC") {
            self.metric = v;
        }
        if let Some(v) = lookup("FACEVERIFY_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEVERIFY_THRESHOLDS") {
            self.thresholds = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.padding.is_finite() || self.padding < 0.0 {
            return Err(ConfigError::Invalid {
                key: "padding",
                reason: format!("must be finite and >= 0, got {}", self.padding),
            });
        }
        for id in self.model_ids() {
            if id.parse::<ModelVariant>().is_err() {
                return Err(ConfigError::Invalid { key: "model", reason: format!("unsupported model '{id}'") });
            }
        }
        let d = &self.detector;
        if !(0.0..=1.0).contains(&d.confidence_threshold) || !(0.0..=1.0).contains(&d.nms_threshold) {
            return Err(ConfigError::Invalid {
                key: "detector",
                reason: "confidence_threshold and nms_threshold must lie in [0, 1]".to_string(),
            });
        }
        Ok(())
    }

    /// `model` followed by `preload`, canonicalized and without duplicates.
    ///
    /// Ids naming no built-in variant are passed through unchanged for
    /// `validate` to reject.
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in std::iter::once(&self.model).chain(&self.preload) {
            let id = ModelVariant::canonical_id(id);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// The configured default model in canonical form.
    pub fn default_model_id(&self) -> String {
        ModelVariant::canonical_id(&self.model)
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector.model)
    }
}

/// `$XDG_DATA_HOME/faceverify/models`, falling back to `~/.local/share/faceverify/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceverify")
        .join("models")
}
