//! In-crate stand-ins for the model-backed components, used by unit tests.

use crate::detector::{DetectorError, FaceLocator};
use crate::recognizer::{
    check_input, finish_embedding, Alignment, ChannelOrder, EmbeddingModel, InputDescriptor, ModelDescriptor,
    PixelNormalization, RecognizerError,
};
use crate::types::{Device, Embedding, EmbeddingNorm, FaceRegion, Image, NormalizedFace};
use image::Rgb;

/// Treats the bounding box of all non-black pixels as the single face.
pub(crate) struct BrightRegionLocator;

impl FaceLocator for BrightRegionLocator {
    fn detect(&self, image: &Image) -> Result<Vec<FaceRegion>, DetectorError> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, pixel) in image.enumerate_pixels() {
            if pixel.0 == [0, 0, 0] {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }

        Ok(bounds
            .map(|(x0, y0, x1, y1)| FaceRegion {
                x: x0 as f32,
                y: y0 as f32,
                width: (x1 - x0 + 1) as f32,
                height: (y1 - y0 + 1) as f32,
                confidence: 0.99,
                landmarks: None,
            })
            .into_iter()
            .collect())
    }
}

/// Returns the same regions for every image.
pub(crate) struct FixedLocator(pub Vec<FaceRegion>);

impl FaceLocator for FixedLocator {
    fn detect(&self, _image: &Image) -> Result<Vec<FaceRegion>, DetectorError> {
        Ok(self.0.clone())
    }
}

/// Embeds a face as its mean color in [0, 1] per channel.
pub(crate) struct MeanColorModel {
    descriptor: ModelDescriptor,
}

impl MeanColorModel {
    pub(crate) fn new() -> Self {
        Self::with_id("stub")
    }

    pub(crate) fn with_id(id: &str) -> Self {
        Self {
            descriptor: ModelDescriptor {
                id: id.to_string(),
                input: InputDescriptor {
                    width: 8,
                    height: 8,
                    pixels: PixelNormalization { mean: [0.0; 3], std: [255.0; 3], order: ChannelOrder::Rgb },
                    alignment: Alignment::Crop,
                },
                embedding_dim: 3,
                norm: EmbeddingNorm::Raw,
                device: Device::Cpu,
            },
        }
    }
}

impl EmbeddingModel for MeanColorModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn embed(&self, face: &NormalizedFace) -> Result<Embedding, RecognizerError> {
        check_input(&self.descriptor, face)?;
        let raw = (0..3)
            .map(|c| face.tensor.index_axis(ndarray::Axis(1), c).mean().unwrap_or(0.0))
            .collect();
        finish_embedding(&self.descriptor, raw)
    }
}

/// `w`×`h` black image with one solid rectangle standing in for a face.
pub(crate) fn face_image(w: u32, h: u32, rect: (u32, u32, u32, u32), color: [u8; 3]) -> Image {
    let (rx, ry, rw, rh) = rect;
    Image::from_fn(w, h, |x, y| {
        if x >= rx && x < rx + rw && y >= ry && y < ry + rh {
            Rgb(color)
        } else {
            Rgb([0, 0, 0])
        }
    })
}
