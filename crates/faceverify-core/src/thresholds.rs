//! Threshold Registry: calibrated decision thresholds keyed by (model, metric).
//!
//! The built-in table is embedded at compile time from `data/thresholds.toml`.
//! A provisioning-supplied TOML file with the same layout can extend or
//! override it:
//!
//! ```toml
//! [arcface]
//! cosine = 0.68
//! euclidean = 1.13
//! ```

use crate::distance::Metric;
use crate::recognizer::ModelVariant;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const BUILTIN_THRESHOLDS: &str = include_str!("../data/thresholds.toml");

#[derive(Error, Debug)]
pub enum ThresholdError {
    #[error("no threshold defined for model '{model}' with metric '{metric}'")]
    NotDefined { model: String, metric: Metric },
    #[error("failed to read threshold table {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed threshold table: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("threshold table names unknown metric '{metric}' for model '{model}'")]
    UnknownMetric { model: String, metric: String },
    #[error("threshold table lists metric '{metric}' more than once for model '{model}'")]
    DuplicateMetric { model: String, metric: Metric },
    #[error("threshold for model '{model}' metric '{metric}' must be finite and >= 0, got {value}")]
    InvalidValue { model: String, metric: Metric, value: f32 },
}

/// Immutable-after-startup table of (model, metric) → threshold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdRegistry {
    table: BTreeMap<String, BTreeMap<Metric, f32>>,
}

impl ThresholdRegistry {
    /// The calibration table shipped with the crate.
    pub fn builtin() -> Result<Self, ThresholdError> {
        Self::from_toml_str(BUILTIN_THRESHOLDS)
    }

    /// Parse a `[model] metric = value` table.
    ///
    /// Built-in model names and metric keys compare case-insensitively;
    /// naming one metric twice for the same model is an error.
    pub fn from_toml_str(src: &str) -> Result<Self, ThresholdError> {
        let raw: BTreeMap<String, BTreeMap<String, f32>> = toml::from_str(src)?;

        let mut registry = Self::default();
        for (model, metrics) in raw {
            let model = ModelVariant::canonical_id(&model);
            for (metric_id, value) in metrics {
                let metric = metric_id.parse::<Metric>().map_err(|_| ThresholdError::UnknownMetric {
                    model: model.clone(),
                    metric: metric_id.clone(),
                })?;
                if registry.lookup(&model, metric).is_ok() {
                    return Err(ThresholdError::DuplicateMetric { model, metric });
                }
                registry.insert(&model, metric, value)?;
            }
        }
        Ok(registry)
    }

    pub fn from_path(path: &Path) -> Result<Self, ThresholdError> {
        let src = std::fs::read_to_string(path).map_err(|source| ThresholdError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_toml_str(&src)?;
        tracing::info!(path = %path.display(), entries = registry.len(), "loaded threshold table");
        Ok(registry)
    }

    pub fn insert(&mut self, model: &str, metric: Metric, value: f32) -> Result<(), ThresholdError> {
        if !value.is_finite() || value < 0.0 {
            return Err(ThresholdError::InvalidValue { model: model.to_string(), metric, value });
        }
        self.table.entry(model.to_string()).or_default().insert(metric, value);
        Ok(())
    }

    /// Overlay `other` on top of `self`; entries in `other` win.
    pub fn merge(&mut self, other: ThresholdRegistry) {
        for (model, metrics) in other.table {
            self.table.entry(model).or_default().extend(metrics);
        }
    }

    pub fn lookup(&self, model: &str, metric: Metric) -> Result<f32, ThresholdError> {
        self.table
            .get(model)
            .and_then(|m| m.get(&metric))
            .copied()
            .ok_or_else(|| ThresholdError::NotDefined { model: model.to_string(), metric })
    }

    /// Every threshold known for `model`, in metric order.
    pub fn for_model(&self, model: &str) -> Vec<(Metric, f32)> {
        self.table
            .get(model)
            .map(|m| m.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }

    /// (model, metric) pairs among `models` × every supported metric with no entry.
    pub fn missing<'a>(&self, models: impl IntoIterator<Item = &'a str>) -> Vec<(String, Metric)> {
        models
            .into_iter()
            .flat_map(|model| Metric::ALL.into_iter().map(move |metric| (model, metric)))
            .filter(|(model, metric)| self.lookup(model, *metric).is_err())
            .map(|(model, metric)| (model.to_string(), metric))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_variant_and_metric() {
        let registry = ThresholdRegistry::builtin().unwrap();
        let ids: Vec<&str> = ModelVariant::ALL.iter().map(|v| v.id()).collect();
        assert!(registry.missing(ids).is_empty());
        assert_eq!(registry.len(), ModelVariant::ALL.len() * Metric::ALL.len());
    }

    #[test]
    fn test_builtin_values_positive() {
        let registry = ThresholdRegistry::builtin().unwrap();
        for variant in ModelVariant::ALL {
            for (_, value) in registry.for_model(variant.id()) {
                assert!(value > 0.0);
            }
        }
        assert!((registry.lookup("arcface", Metric::Cosine).unwrap() - 0.68).abs() < 1e-6);
    }

    #[test]
    fn test_lookup_missing() {
        let registry = ThresholdRegistry::from_toml_str("[m]\ncosine = 0.4\n").unwrap();
        let err = registry.lookup("m", Metric::Euclidean).unwrap_err();
        assert!(matches!(err, ThresholdError::NotDefined { ref model, metric: Metric::Euclidean } if model == "m"));
        assert!(registry.lookup("other", Metric::Cosine).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_metric() {
        let err = ThresholdRegistry::from_toml_str("[m]\nhamming = 3.0\n").unwrap_err();
        assert!(matches!(err, ThresholdError::UnknownMetric { .. }));
    }

    #[test]
    fn test_parse_rejects_duplicate_metric() {
        let err = ThresholdRegistry::from_toml_str("[m]\nL1 = 1.0\nl1 = 2.0\n").unwrap_err();
        assert!(matches!(err, ThresholdError::DuplicateMetric { ref model, metric: Metric::L1 } if model == "m"));

        let err = ThresholdRegistry::from_toml_str("[ArcFace]\ncosine = 0.6\n[arcface]\ncosine = 0.7\n").unwrap_err();
        assert!(matches!(err, ThresholdError::DuplicateMetric { ref model, .. } if model == "arcface"));

        // The same metric under two different models is fine.
        let registry = ThresholdRegistry::from_toml_str("[a]\nL1 = 1.0\n[b]\nl1 = 2.0\n").unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_parse_rejects_negative() {
        let err = ThresholdRegistry::from_toml_str("[m]\nL1 = -1.0\n").unwrap_err();
        assert!(matches!(err, ThresholdError::InvalidValue { metric: Metric::L1, .. }));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            ThresholdRegistry::from_toml_str("[m]\ncosine = \"high\"\n"),
            Err(ThresholdError::Parse(_))
        ));
    }

    #[test]
    fn test_merge_overrides_and_extends() {
        let mut base = ThresholdRegistry::builtin().unwrap();
        let overlay = ThresholdRegistry::from_toml_str("[arcface]\ncosine = 0.5\n[custom]\nL1 = 2.0\n").unwrap();
        base.merge(overlay);
        assert_eq!(base.lookup("arcface", Metric::Cosine).unwrap(), 0.5);
        assert!((base.lookup("arcface", Metric::Euclidean).unwrap() - 1.13).abs() < 1e-6);
        assert_eq!(base.lookup("custom", Metric::L1).unwrap(), 2.0);
    }

    #[test]
    fn test_missing_lists_gaps() {
        let registry = ThresholdRegistry::from_toml_str("[m]\ncosine = 0.4\nL1 = 1.0\neuclidean = 0.9\n").unwrap();
        assert_eq!(registry.missing(["m"]), vec![("m".to_string(), Metric::EuclideanL2)]);
    }

    #[test]
    fn test_from_path_missing_file() {
        assert!(matches!(
            ThresholdRegistry::from_path(Path::new("/nonexistent/thresholds.toml")),
            Err(ThresholdError::Read { .. })
        ));
    }
}
