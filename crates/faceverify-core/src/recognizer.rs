//! Embedding Model: the `EmbeddingModel` capability, model descriptors and
//! the ONNX-backed variants (VGGFace2, ArcFace).

use crate::session::open_session;
use crate::types::{Device, Embedding, EmbeddingNorm, NormalizedFace};
use ort::session::Session;
use ort::value::TensorRef;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face was normalized for model '{actual}', not '{expected}'")]
    WrongModel { expected: String, actual: String },
    #[error("input tensor shape {actual:?} does not match expected {expected:?}")]
    InputShape { expected: [usize; 4], actual: Vec<usize> },
    #[error("expected {expected}-dim embedding, got {actual}")]
    OutputDimension { expected: usize, actual: usize },
    #[error("embedding session lock poisoned")]
    SessionPoisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Channel order the model consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Per-channel `(value - mean) / std`, with mean/std listed in model channel order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelNormalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub order: ChannelOrder,
}

impl PixelNormalization {
    /// Normalize one RGB pixel into model channel order.
    pub fn apply(&self, rgb: [u8; 3]) -> [f32; 3] {
        let ordered = match self.order {
            ChannelOrder::Rgb => rgb,
            ChannelOrder::Bgr => [rgb[2], rgb[1], rgb[0]],
        };
        std::array::from_fn(|c| (ordered[c] as f32 - self.mean[c]) / self.std[c])
    }
}

/// How a detected region becomes the model's input raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Padded crop, resized to the input size.
    Crop,
    /// Five-point similarity warp onto the reference template.
    Landmarks,
}

/// What a model expects as input.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDescriptor {
    pub width: u32,
    pub height: u32,
    pub pixels: PixelNormalization,
    pub alignment: Alignment,
}

/// Everything the pipeline needs to know about a loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    /// Registry and threshold-table key.
    pub id: String,
    pub input: InputDescriptor,
    pub embedding_dim: usize,
    pub norm: EmbeddingNorm,
    /// Backend the model was bound to at load time.
    pub device: Device,
}

impl ModelDescriptor {
    /// NCHW shape of the input tensor.
    pub fn input_shape(&self) -> [usize; 4] {
        [1, 3, self.input.height as usize, self.input.width as usize]
    }
}

/// Maps a normalized face to an identity embedding.
///
/// Implementations are immutable after load and safe to call from many threads.
pub trait EmbeddingModel: Send + Sync {
    fn descriptor(&self) -> &ModelDescriptor;

    fn embed(&self, face: &NormalizedFace) -> Result<Embedding, RecognizerError>;
}

/// Check that `face` was produced for `descriptor`.
pub fn check_input(descriptor: &ModelDescriptor, face: &NormalizedFace) -> Result<(), RecognizerError> {
    if face.model_id != descriptor.id {
        return Err(RecognizerError::WrongModel {
            expected: descriptor.id.clone(),
            actual: face.model_id.clone(),
        });
    }
    let expected = descriptor.input_shape();
    if face.tensor.shape() != expected.as_slice() {
        return Err(RecognizerError::InputShape {
            expected,
            actual: face.tensor.shape().to_vec(),
        });
    }
    Ok(())
}

/// Apply the descriptor's norm convention to a raw model output.
pub fn finish_embedding(descriptor: &ModelDescriptor, raw: Vec<f32>) -> Result<Embedding, RecognizerError> {
    if raw.len() != descriptor.embedding_dim {
        return Err(RecognizerError::OutputDimension {
            expected: descriptor.embedding_dim,
            actual: raw.len(),
        });
    }

    let values = match descriptor.norm {
        EmbeddingNorm::Raw => raw,
        EmbeddingNorm::L2 => {
            let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                raw.iter().map(|x| x / norm).collect()
            } else {
                raw
            }
        }
    };

    Ok(Embedding {
        values,
        model_id: descriptor.id.clone(),
        norm: descriptor.norm,
    })
}

/// Built-in embedding backbones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    /// InceptionResnetV1 trained on VGGFace2: 160×160 padded crop, 512-d.
    VggFace2,
    /// ArcFace w600k_r50: 112×112 landmark-aligned, 512-d.
    ArcFace,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 2] = [ModelVariant::VggFace2, ModelVariant::ArcFace];

    pub fn id(&self) -> &'static str {
        match self {
            ModelVariant::VggFace2 => "vggface2",
            ModelVariant::ArcFace => "arcface",
        }
    }

    /// Lowercase id of the variant `id` names, or `id` unchanged when it names none.
    pub fn canonical_id(id: &str) -> String {
        id.parse::<ModelVariant>()
            .map(|v| v.id().to_string())
            .unwrap_or_else(|_| id.to_string())
    }

    /// ONNX file name inside the model directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            ModelVariant::VggFace2 => "vggface2.onnx",
            ModelVariant::ArcFace => "w600k_r50.onnx",
        }
    }

    pub fn descriptor(&self, device: Device) -> ModelDescriptor {
        let input = match self {
            ModelVariant::VggFace2 => InputDescriptor {
                width: 160,
                height: 160,
                pixels: PixelNormalization { mean: [127.5; 3], std: [128.0; 3], order: ChannelOrder::Rgb },
                alignment: Alignment::Crop,
            },
            // ArcFace uses symmetric normalization (std 127.5, not 128).
            ModelVariant::ArcFace => InputDescriptor {
                width: 112,
                height: 112,
                pixels: PixelNormalization { mean: [127.5; 3], std: [127.5; 3], order: ChannelOrder::Rgb },
                alignment: Alignment::Landmarks,
            },
        };

        ModelDescriptor {
            id: self.id().to_string(),
            input,
            embedding_dim: 512,
            norm: EmbeddingNorm::L2,
            device,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ModelVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelVariant::ALL
            .into_iter()
            .find(|v| v.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| s.to_string())
    }
}

/// An embedding backbone running in an ONNX Runtime session.
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    descriptor: ModelDescriptor,
}

impl OnnxEmbedder {
    /// Load `variant` from `model_path` and bind it to `device`.
    pub fn load(variant: ModelVariant, model_path: &Path, device: Device) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = open_session(model_path, device)?;
        let descriptor = variant.descriptor(device);

        tracing::info!(
            model = %descriptor.id,
            path = %model_path.display(),
            %device,
            dim = descriptor.embedding_dim,
            "embedding model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            descriptor,
        })
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn embed(&self, face: &NormalizedFace) -> Result<Embedding, RecognizerError> {
        check_input(&self.descriptor, face)?;

        let mut session = self.session.lock().map_err(|_| RecognizerError::SessionPoisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(face.tensor.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        finish_embedding(&self.descriptor, raw.to_vec())
    }
}
