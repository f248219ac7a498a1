//! YOLO (v8 / 11 layout) output decoding.
//!
//! The model emits a `[1, 4 + C, N]` tensor: for each of `N` candidates, a
//! `cx, cy, w, h` box in model-input pixels followed by `C` class scores.
//! Decoding is kept free of any inference runtime so it can be tested alone.

use std::cmp::Ordering;

use crate::detect::result::{BoundingBox, Detection};

pub const DEFAULT_CONFIDENCE: f32 = 0.25;
pub const DEFAULT_IOU: f32 = 0.45;
pub const DEFAULT_MAX_DETECTIONS: usize = 100;

/// COCO-80 class names, in model index order.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

#[derive(Clone, Copy, Debug)]
pub struct DecodeParams {
    pub confidence: f32,
    pub iou: f32,
    pub max_detections: usize,
    /// Frame-pixels per model-pixel, horizontally and vertically.
    pub scale_x: f32,
    pub scale_y: f32,
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE,
            iou: DEFAULT_IOU,
            max_detections: DEFAULT_MAX_DETECTIONS,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }
}

pub fn class_name(class_id: usize) -> String {
    COCO_CLASSES
        .get(class_id)
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("class_{}", class_id))
}

/// Decode a channel-major output (`rows = 4 + C`, `cols = N`) into detections.
///
/// `at(row, col)` reads one value. Results are sorted by confidence and
/// reduced with class-aware NMS.
pub fn decode<F>(rows: usize, cols: usize, at: F, params: &DecodeParams) -> Vec<Detection>
where
    F: Fn(usize, usize) -> f32,
{
    if rows <= 4 {
        return Vec::new();
    }
    let mut candidates = Vec::new();
    for i in 0..cols {
        let mut best_class = 0;
        let mut best_score = f32::NEG_INFINITY;
        for class in 0..rows - 4 {
            let score = at(4 + class, i);
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if best_score.is_nan() || best_score < params.confidence {
            continue;
        }
        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let bbox = BoundingBox::new(
            (cx - w / 2.0) * params.scale_x,
            (cy - h / 2.0) * params.scale_y,
            (cx + w / 2.0) * params.scale_x,
            (cy + h / 2.0) * params.scale_y,
        );
        candidates.push((best_class, Detection::new(class_name(best_class), best_score, bbox)));
    }

    candidates.sort_by(|a, b| {
        b.1.confidence
            .partial_cmp(&a.1.confidence)
            .unwrap_or(Ordering::Equal)
    });
    nms(candidates, params.iou, params.max_detections)
}

/// Greedy per-class non-maximum suppression over confidence-sorted input.
fn nms(sorted: Vec<(usize, Detection)>, iou: f32, max: usize) -> Vec<Detection> {
    let mut keep: Vec<(usize, Detection)> = Vec::new();
    for (class, det) in sorted {
        if keep.len() >= max {
            break;
        }
        let suppressed = keep
            .iter()
            .any(|(k_class, kept)| *k_class == class && kept.bbox.iou(&det.bbox) > iou);
        if !suppressed {
            keep.push((class, det));
        }
    }
    keep.into_iter().map(|(_, det)| det).collect()
}
