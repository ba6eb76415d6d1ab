//! Face Locator: the `FaceLocator` capability and its SCRFD implementation.
//!
//! SCRFD (Sample and Computation Redistribution for Efficient Face Detection)
//! runs on a letterboxed RGB input with 3-stride anchor-free decoding and NMS
//! post-processing. Regions come back in original image coordinates.

use crate::session::open_session;
use crate::types::{Device, FaceRegion, Image};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface and place in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image has zero area ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("detector session lock poisoned")]
    SessionPoisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds candidate faces in an image. Pure with respect to the image.
pub trait FaceLocator: Send + Sync {
    fn detect(&self, image: &Image) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Tunables for the SCRFD locator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    /// Model file name, resolved against the model directory.
    pub model: String,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: "det_10g.onnx".to_string(),
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

/// Pick the single face the pipeline continues with.
///
/// Highest confidence wins; ties go to the larger box, then to the leftmost box.
pub fn select_best(regions: &[FaceRegion]) -> Option<&FaceRegion> {
    regions.iter().min_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.area().total_cmp(&a.area()))
            .then_with(|| a.x.total_cmp(&b.x))
    })
}

/// Metadata for coordinate de-mapping after letterbox resize.
///
/// `pad_x`/`pad_y` are the whole-pixel offsets the resized image was pasted at.
struct LetterboxInfo {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face locator.
pub struct ScrfdLocator {
    session: Mutex<Session>,
    config: DetectorConfig,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdLocator {
    /// Load the SCRFD ONNX model and bind it to `device`.
    pub fn load(model_path: &Path, device: Device, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = open_session(model_path, device)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");
        tracing::info!(
            path = %model_path.display(),
            confidence_threshold = config.confidence_threshold,
            nms_threshold = config.nms_threshold,
            "SCRFD locator loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            config,
            stride_indices,
        })
    }

    /// Letterbox an RGB image into a `[1, 3, 640, 640]` tensor.
    ///
    /// Padding is filled with the mean so it normalizes to 0.0.
    fn preprocess(image: &Image) -> Result<(Array4<f32>, LetterboxInfo), DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::EmptyImage { width, height });
        }

        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let pad_x = (SCRFD_INPUT_SIZE as u32 - new_w) / 2;
        let pad_y = (SCRFD_INPUT_SIZE as u32 - new_h) / 2;

        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, (pad_y + y) as usize, (pad_x + x) as usize]] =
                    (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        Ok((tensor, LetterboxInfo { scale, pad_x, pad_y }))
    }
}

impl FaceLocator for ScrfdLocator {
    fn detect(&self, image: &Image) -> Result<Vec<FaceRegion>, DetectorError> {
        let (input, letterbox) = Self::preprocess(image)?;

        let mut session = self.session.lock().map_err(|_| DetectorError::SessionPoisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                self.config.confidence_threshold,
            ));
        }

        let result = nms(all_detections, self.config.nms_threshold);
        tracing::debug!(faces = result.len(), "SCRFD detection complete");
        Ok(result)
    }
}

/// Map SCRFD output tensors to stride slots.
///
/// Uses names like "score_8" / "bbox_16" / "kps_32" when the export has them,
/// otherwise the standard positional ordering:
///   [0-2] = scores, [3-5] = bboxes, [6-8] = kps (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(slots) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [slots[0], slots[1], slots[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level into original image coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<FaceRegion> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unmap = |px: f32, py: f32| {
        (
            (px - letterbox.pad_x as f32) / letterbox.scale,
            (py - letterbox.pad_y as f32) / letterbox.scale,
        )
    };

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let bbox_off = idx * 4;
        let Some(offsets) = bboxes.get(bbox_off..bbox_off + 4) else {
            continue;
        };

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * s;
        let anchor_cy = (anchor_idx / grid) as f32 * s;

        let (x1, y1) = unmap(anchor_cx - offsets[0] * s, anchor_cy - offsets[1] * s);
        let (x2, y2) = unmap(anchor_cx + offsets[2] * s, anchor_cy + offsets[3] * s);

        let kps_off = idx * 10;
        let landmarks = kps.get(kps_off..kps_off + 10).map(|points| {
            std::array::from_fn(|i| unmap(anchor_cx + points[i * 2] * s, anchor_cy + points[i * 2 + 1] * s))
        });

        detections.push(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score.clamp(0.0, 1.0),
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let mut keep: Vec<FaceRegion> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union between two regions.
fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_region(x: f32, y: f32, w: f32, h: f32, conf: f32) -> FaceRegion {
        FaceRegion { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_region(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = make_region(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_region(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_region(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_region(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap 50, union 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_region(5.0, 5.0, 100.0, 100.0, 0.8),
            make_region(200.0, 200.0, 50.0, 50.0, 0.7),
            make_region(0.0, 0.0, 100.0, 100.0, 0.9),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_select_best_highest_confidence() {
        let regions = vec![
            make_region(0.0, 0.0, 50.0, 50.0, 0.7),
            make_region(100.0, 0.0, 10.0, 10.0, 0.95),
            make_region(200.0, 0.0, 80.0, 80.0, 0.9),
        ];
        assert_eq!(select_best(&regions).unwrap().x, 100.0);
    }

    #[test]
    fn test_select_best_tie_prefers_larger_area() {
        let regions = vec![
            make_region(0.0, 0.0, 20.0, 20.0, 0.9),
            make_region(100.0, 0.0, 40.0, 40.0, 0.9),
        ];
        assert_eq!(select_best(&regions).unwrap().x, 100.0);
    }

    #[test]
    fn test_select_best_tie_prefers_leftmost() {
        let regions = vec![
            make_region(120.0, 0.0, 30.0, 30.0, 0.9),
            make_region(40.0, 10.0, 30.0, 30.0, 0.9),
            make_region(80.0, 0.0, 30.0, 30.0, 0.9),
        ];
        assert_eq!(select_best(&regions).unwrap().x, 40.0);
    }

    #[test]
    fn test_select_best_is_order_independent() {
        let mut regions = vec![
            make_region(10.0, 0.0, 30.0, 30.0, 0.9),
            make_region(5.0, 0.0, 30.0, 30.0, 0.9),
            make_region(0.0, 0.0, 20.0, 20.0, 0.9),
        ];
        let first = select_best(&regions).cloned();
        regions.reverse();
        assert_eq!(select_best(&regions).cloned(), first);
        assert_eq!(first.unwrap().x, 5.0);
    }

    #[test]
    fn test_select_best_empty() {
        assert!(select_best(&[]).is_none());
    }

    #[test]
    fn test_preprocess_letterbox_shape_and_padding() {
        let image = Image::from_pixel(320, 160, image::Rgb([255, 255, 255]));
        let (tensor, letterbox) = ScrfdLocator::preprocess(&image).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert_eq!(letterbox.pad_x, 0);
        assert_eq!(letterbox.pad_y, 160);
        // Padding rows normalize to zero, image rows carry the white value.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let white = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 2, 320, 320]] - white).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_rejects_empty_image() {
        let image = Image::new(0, 10);
        assert!(matches!(
            ScrfdLocator::preprocess(&image),
            Err(DetectorError::EmptyImage { width: 0, height: 10 })
        ));
    }

    #[test]
    fn test_decode_stride_maps_back_to_image_space() {
        let grid = SCRFD_INPUT_SIZE / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];

        // Anchor 2 sits at cell (1, 0) → centre (32, 0) in letterboxed space.
        scores[2] = 0.8;
        bboxes[8..12].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0, pad_y: 0 };
        let dets = decode_stride(&scores, &bboxes, &kps, 32, &letterbox, 0.5);

        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 8.0).abs() < 1e-4, "x = {}", d.x);
        assert!((d.width - 16.0).abs() < 1e-4, "w = {}", d.width);
        assert!((d.height - 16.0).abs() < 1e-4, "h = {}", d.height);
        assert!((d.confidence - 0.8).abs() < 1e-6);
        assert_eq!(d.landmarks.unwrap()[0], (16.0, 0.0));
    }

    #[test]
    fn test_odd_letterbox_padding_round_trips() {
        // 640x401 at scale 1 leaves 239 rows of padding: 119 above, 120 below.
        let image = Image::from_pixel(640, 401, image::Rgb([255, 255, 255]));
        let (tensor, letterbox) = ScrfdLocator::preprocess(&image).unwrap();
        assert_eq!(letterbox.pad_y, 119);

        let white = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert_eq!(tensor[[0, 0, 118, 10]], 0.0);
        assert!((tensor[[0, 0, 119, 10]] - white).abs() < 1e-6);
        assert!((tensor[[0, 0, 519, 10]] - white).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 520, 10]], 0.0);

        // A box whose top edge sits on the first image row maps back to y = 0.
        let grid = SCRFD_INPUT_SIZE / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        // Anchor at cell (0, 4): centre (0, 128) in letterboxed space.
        let idx = 4 * grid * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.0, 9.0 / 32.0, 1.0, 1.0]);

        let dets = decode_stride(&scores, &bboxes, &[], 32, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        assert!(dets[0].y.abs() < 1e-4, "y = {}", dets[0].y);
    }

    #[test]
    fn test_decode_stride_skips_low_scores() {
        let grid = SCRFD_INPUT_SIZE / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let scores = vec![0.3f32; anchors];
        let bboxes = vec![1.0f32; anchors * 4];
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0, pad_y: 0 };
        assert!(decode_stride(&scores, &bboxes, &[], 32, &letterbox, 0.5).is_empty());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8", "bbox_16", "bbox_32",
            "kps_8", "kps_16", "kps_32",
        ].iter().map(|s| s.to_string()).collect();

        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        assert_eq!(discover_output_indices(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_load_missing_model() {
        let result = ScrfdLocator::load(Path::new("/nonexistent/det.onnx"), Device::Cpu, DetectorConfig::default());
        assert!(matches!(result, Err(DetectorError::ModelNotFound(_))));
    }
}
