//! Registry of loaded embedding models, keyed by identifier.

use crate::recognizer::{EmbeddingModel, ModelVariant, OnnxEmbedder, RecognizerError};
use crate::types::Device;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Alias resolved to the configured default model.
pub const DEFAULT_MODEL_ALIAS: &str = "default";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unsupported model '{0}'")]
    Unsupported(String),
    #[error("failed to load model '{id}': {source}")]
    Load {
        id: String,
        #[source]
        source: RecognizerError,
    },
}

/// Process-wide set of embedding models, read-only once built.
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<dyn EmbeddingModel>>,
    default_id: String,
}

impl ModelRegistry {
    pub fn new(default_id: impl Into<String>) -> Self {
        Self {
            models: BTreeMap::new(),
            default_id: default_id.into(),
        }
    }

    /// Load the built-in variants named in `ids` from `model_dir`.
    pub fn load(model_dir: &Path, ids: &[String], default_id: &str, device: Device) -> Result<Self, ModelError> {
        Self::load_with(ids, default_id, |variant| {
            let path = model_dir.join(variant.file_name());
            let model: Arc<dyn EmbeddingModel> = Arc::new(OnnxEmbedder::load(variant, &path, device)?);
            Ok(model)
        })
    }

    /// Build a registry from the variants named in `ids`, materializing each
    /// one with `loader`.
    ///
    /// Ids are matched case-insensitively and stored in canonical form.
    /// `default_id` must name one of them.
    pub fn load_with<F>(ids: &[String], default_id: &str, loader: F) -> Result<Self, ModelError>
    where
        F: Fn(ModelVariant) -> Result<Arc<dyn EmbeddingModel>, RecognizerError>,
    {
        let default_variant: ModelVariant = default_id.parse().map_err(ModelError::Unsupported)?;
        let mut registry = Self::new(default_variant.id());

        for id in ids {
            let variant: ModelVariant = id.parse().map_err(ModelError::Unsupported)?;
            if registry.models.contains_key(variant.id()) {
                continue;
            }
            let model = loader(variant).map_err(|source| ModelError::Load {
                id: variant.id().to_string(),
                source,
            })?;
            registry.register(model);
        }

        // The default must name a loaded model.
        registry.get(DEFAULT_MODEL_ALIAS)?;
        Ok(registry)
    }

    /// Add or replace a model under its descriptor id.
    pub fn register(&mut self, model: Arc<dyn EmbeddingModel>) {
        let id = model.descriptor().id.clone();
        tracing::debug!(model = %id, "registered embedding model");
        self.models.insert(id, model);
    }

    /// Map the "default" alias to the configured id; other ids pass through.
    pub fn resolve_id<'a>(&'a self, requested: &'a str) -> &'a str {
        if requested.eq_ignore_ascii_case(DEFAULT_MODEL_ALIAS) {
            &self.default_id
        } else {
            requested
        }
    }

    /// Look up a model by id (case-insensitive) or by the "default" alias.
    pub fn get(&self, requested: &str) -> Result<&Arc<dyn EmbeddingModel>, ModelError> {
        let id = self.resolve_id(requested);
        self.models
            .get(id)
            .or_else(|| {
                self.models
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(id))
                    .map(|(_, model)| model)
            })
            .ok_or_else(|| ModelError::Unsupported(id.to_string()))
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// Loaded model identifiers in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}
