//! Face Normalizer: turns an image plus a detected region into the exact
//! tensor a given embedding model expects.
//!
//! Two geometric paths, chosen by the model's input descriptor:
//! - `Alignment::Crop`: expand the box by the padding ratio, clip to the
//!   image, crop and resize (bilinear) to the model input size.
//! - `Alignment::Landmarks`: similarity-warp the five landmarks onto the
//!   reference template.
//!
//! Pixel values are then normalized per channel in the model's channel order.

use crate::alignment;
use crate::recognizer::{Alignment, ModelDescriptor, PixelNormalization};
use crate::types::{FaceRegion, Image, NormalizedFace};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum NormalizeError {
    #[error("face region collapses to zero area after padding and clipping")]
    EmptyRegion,
    #[error("face region has non-finite coordinates")]
    NonFiniteRegion,
    #[error("padding ratio must be finite and >= 0, got {0}")]
    InvalidPadding(f32),
    #[error("model requires landmark alignment but the region has no landmarks")]
    MissingLandmarks,
    #[error("landmarks are degenerate, no alignment transform exists")]
    DegenerateLandmarks,
    #[error("landmark alignment needs a square model input, got {width}x{height}")]
    NonSquareAlignment { width: u32, height: u32 },
}

/// Integer crop rectangle inside the image bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Expand `region` by `padding` and clip it to a `img_w`×`img_h` image.
///
/// Total growth is `padding * side`, split evenly between both sides,
/// so a padding of 1.0 doubles each dimension before clipping.
pub fn padded_crop_box(
    region: &FaceRegion,
    padding: f32,
    img_w: u32,
    img_h: u32,
) -> Result<CropBox, NormalizeError> {
    if !padding.is_finite() || padding < 0.0 {
        return Err(NormalizeError::InvalidPadding(padding));
    }
    if ![region.x, region.y, region.width, region.height].iter().all(|v| v.is_finite()) {
        return Err(NormalizeError::NonFiniteRegion);
    }
    if region.width <= 0.0 || region.height <= 0.0 {
        return Err(NormalizeError::EmptyRegion);
    }

    let margin_x = region.width * padding / 2.0;
    let margin_y = region.height * padding / 2.0;

    let x0 = (region.x - margin_x).floor().clamp(0.0, img_w as f32) as u32;
    let y0 = (region.y - margin_y).floor().clamp(0.0, img_h as f32) as u32;
    let x1 = (region.x + region.width + margin_x).ceil().clamp(0.0, img_w as f32) as u32;
    let y1 = (region.y + region.height + margin_y).ceil().clamp(0.0, img_h as f32) as u32;

    if x1 <= x0 || y1 <= y0 {
        return Err(NormalizeError::EmptyRegion);
    }

    Ok(CropBox { x: x0, y: y0, width: x1 - x0, height: y1 - y0 })
}

/// Produce the model-specific input tensor for one face.
pub fn normalize(
    image: &Image,
    region: &FaceRegion,
    descriptor: &ModelDescriptor,
    padding: f32,
) -> Result<NormalizedFace, NormalizeError> {
    let input = &descriptor.input;
    let crop = padded_crop_box(region, padding, image.width(), image.height())?;

    let face = match input.alignment {
        Alignment::Crop => {
            let cropped = imageops::crop_imm(image, crop.x, crop.y, crop.width, crop.height).to_image();
            imageops::resize(&cropped, input.width, input.height, FilterType::Triangle)
        }
        Alignment::Landmarks => {
            if input.width != input.height {
                return Err(NormalizeError::NonSquareAlignment { width: input.width, height: input.height });
            }
            let landmarks = region.landmarks.as_ref().ok_or(NormalizeError::MissingLandmarks)?;
            alignment::align_face(image, landmarks, input.width)
                .ok_or(NormalizeError::DegenerateLandmarks)?
        }
    };

    tracing::trace!(
        model = %descriptor.id,
        ?crop,
        out_w = face.width(),
        out_h = face.height(),
        "normalized face"
    );

    Ok(NormalizedFace {
        tensor: to_tensor(&face, &input.pixels),
        model_id: descriptor.id.clone(),
    })
}

/// RGB raster → `[1, 3, H, W]` tensor in the model's channel order and value range.
fn to_tensor(face: &Image, pixels: &PixelNormalization) -> Array4<f32> {
    let (w, h) = face.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in face.enumerate_pixels() {
        let values = pixels.apply(pixel.0);
        for (c, v) in values.into_iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = v;
        }
    }
    tensor
}
