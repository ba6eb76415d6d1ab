//! Image decoding into the pipeline's RGB `Image`.

use crate::types::Image;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to open image {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to decode image bytes: {0}")]
    Decode(#[from] image::ImageError),
}

/// Read and decode an image file of any format the `image` crate supports.
pub fn load_image(path: &Path) -> Result<Image, DecodeError> {
    let decoded = image::open(path).map_err(|source| DecodeError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let rgb = decoded.to_rgb8();
    tracing::debug!(path = %path.display(), width = rgb.width(), height = rgb.height(), "image loaded");
    Ok(rgb)
}

/// Decode an in-memory encoded image (format guessed from content).
pub fn decode_image(bytes: &[u8]) -> Result<Image, DecodeError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbaImage};
    use std::io::Cursor;

    #[test]
    fn test_decode_png_to_rgb() {
        let rgba = RgbaImage::from_pixel(4, 3, image::Rgba([10, 20, 30, 128]));
        let mut bytes = Vec::new();
        rgba.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();

        let image = decode_image(&bytes).unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(*image.get_pixel(2, 1), Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode_image(b"not an image"), Err(DecodeError::Decode(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            load_image(Path::new("/nonexistent/face.jpg")),
            Err(DecodeError::Open { .. })
        ));
    }
}
