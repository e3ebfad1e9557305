use image::{Rgb, RgbImage};
use imageproc::{drawing, rect::Rect};
use serde::Serialize;

use crate::{
    bounding_box::{BoundingBox, Candidate, non_maximum_suppression},
    font,
};

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: i32 = 3;
/// Distance from the box top to the label baseline.
const LABEL_BASELINE: i32 = 30;

/// Detections surviving suppression, best first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeptDetections {
    /// Class name of every kept detection.
    pub class_names: Vec<String>,
    /// Confidence of every kept detection.
    pub confidences: Vec<f32>,
}

impl KeptDetections {
    /// Number of kept detections.
    pub fn len(&self) -> usize {
        self.class_names.len()
    }

    /// Whether nothing survived.
    pub fn is_empty(&self) -> bool {
        self.class_names.is_empty()
    }
}

/// Suppression parameters.
#[derive(Debug, Clone, Copy)]
pub struct SuppressionParams {
    /// Minimum confidence, inclusive.
    pub score_threshold: f32,
    /// IoU above which the weaker box is dropped.
    pub nms_threshold: f32,
    /// Cap on kept detections.
    pub max_detections: usize,
}

/// Name of a class id, falling back to the id itself.
pub fn class_label(classes: &[String], class_id: usize) -> String {
    match classes.get(class_id) {
        Some(name) => name.clone(),
        None => {
            tracing::warn!(class_id, num_classes = classes.len(), "class id has no name");
            class_id.to_string()
        }
    }
}

/// Suppress overlapping candidates and draw the survivors onto `image`.
///
/// An empty candidate list leaves the image untouched.
pub fn suppress_and_render(
    image: &mut RgbImage,
    candidates: &[Candidate],
    classes: &[String],
    params: SuppressionParams,
) -> KeptDetections {
    if candidates.is_empty() {
        return KeptDetections::default();
    }

    let kept = non_maximum_suppression(
        candidates,
        params.score_threshold,
        params.nms_threshold,
        params.max_detections,
    );
    tracing::debug!(candidates = candidates.len(), kept = kept.len(), "suppression done");

    let mut detections = KeptDetections::default();
    for idx in kept {
        let candidate = &candidates[idx];
        let label = class_label(classes, candidate.class_id);
        draw_box(image, &candidate.bbox);
        draw_label(
            image,
            &label,
            candidate.bbox.x,
            candidate.bbox.y + LABEL_BASELINE - font::GLYPH_HEIGHT * LABEL_SCALE,
        );
        detections.class_names.push(label);
        detections.confidences.push(candidate.confidence);
    }
    detections
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox) {
    for inset in 0..BOX_THICKNESS {
        let width = bbox.width - 2 * inset;
        let height = bbox.height - 2 * inset;
        if width <= 0 || height <= 0 {
            break;
        }
        let rect = Rect::at(bbox.x + inset, bbox.y + inset).of_size(width as u32, height as u32);
        drawing::draw_hollow_rect_mut(image, rect, BOX_COLOR);
    }
}

fn draw_label(image: &mut RgbImage, text: &str, x: i32, y: i32) {
    for (col, row) in font::text_pixels(text) {
        let rect = Rect::at(x + col * LABEL_SCALE, y + row * LABEL_SCALE)
            .of_size(LABEL_SCALE as u32, LABEL_SCALE as u32);
        drawing::draw_filled_rect_mut(image, rect, LABEL_COLOR);
    }
}
