//! Distance Engine: dissimilarity between two embeddings under a chosen metric.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistanceError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("embeddings come from different models: '{left}' vs '{right}'")]
    ModelMismatch { left: String, right: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported distance metric '{0}'")]
pub struct UnsupportedMetric(pub String);

/// Supported distance metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    /// 1 − cosine similarity, in [0, 2].
    #[serde(rename = "cosine")]
    Cosine,
    /// Sum of absolute differences.
    #[serde(rename = "L1")]
    L1,
    /// L2 norm of the difference.
    #[serde(rename = "euclidean")]
    Euclidean,
    /// Euclidean distance after L2-normalizing both vectors.
    #[serde(rename = "euclidean_l2")]
    EuclideanL2,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Cosine, Metric::L1, Metric::Euclidean, Metric::EuclideanL2];

    pub fn id(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::L1 => "L1",
            Metric::Euclidean => "euclidean",
            Metric::EuclideanL2 => "euclidean_l2",
        }
    }

    /// Resolve a caller-supplied identifier, falling back to Euclidean.
    ///
    /// The second element is true when the fallback was taken.
    pub fn resolve(requested: &str) -> (Metric, bool) {
        match requested.parse::<Metric>() {
            Ok(metric) => (metric, false),
            Err(e) => {
                tracing::warn!(error = %e, fallback = Metric::Euclidean.id(), "falling back to euclidean distance");
                (Metric::Euclidean, true)
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.id())
    }
}

impl FromStr for Metric {
    type Err = UnsupportedMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnsupportedMetric(s.to_string()))
    }
}

/// Distance between two equal-length vectors; finite inputs give a nonnegative result.
pub fn distance(a: &[f32], b: &[f32], metric: Metric) -> Result<f32, DistanceError> {
    if a.len() != b.len() {
        return Err(DistanceError::DimensionMismatch { left: a.len(), right: b.len() });
    }

    let d = match metric {
        Metric::Cosine => 1.0 - cosine_similarity(a, b),
        Metric::L1 => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        Metric::Euclidean => euclidean(a, b),
        Metric::EuclideanL2 => euclidean(&l2_normalize(a), &l2_normalize(b)),
    };

    // Rounding can leave identical vectors a hair below zero.
    Ok(d.max(0.0))
}

/// Cosine similarity in [-1, 1]; 0 when either vector has zero norm.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

impl Embedding {
    /// Distance to `other`, refusing to compare embeddings from different models.
    pub fn distance_to(&self, other: &Embedding, metric: Metric) -> Result<f32, DistanceError> {
        if self.model_id != other.model_id {
            return Err(DistanceError::ModelMismatch {
                left: self.model_id.clone(),
                right: other.model_id.clone(),
            });
        }
        distance(&self.values, &other.values, metric)
    }
}
