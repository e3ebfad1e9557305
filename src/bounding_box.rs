use serde::Serialize;

/// Axis-aligned box in pixel space, stored as top-left corner plus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    /// Left edge of the box.
    pub x: i32,
    /// Top edge of the box.
    pub y: i32,
    /// Width of the box.
    pub width: i32,
    /// Height of the box.
    pub height: i32,
}

impl BoundingBox {
    /// Create a box from its top-left corner and size.
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Right edge (exclusive) of the box.
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    /// Bottom edge (exclusive) of the box.
    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Area of the box, zero for degenerate boxes.
    pub fn area(&self) -> f32 {
        self.width.max(0) as f32 * self.height.max(0) as f32
    }
}

/// A decoded detection before suppression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Candidate {
    /// Box of the candidate in pixel coordinates of the original frame.
    pub bbox: BoundingBox,
    /// Index of the best scoring class.
    pub class_id: usize,
    /// Score of the best scoring class.
    pub confidence: f32,
}

/// Intersection over union of two bounding boxes.
pub fn iou(b1: &BoundingBox, b2: &BoundingBox) -> f32 {
    let i_xmin = b1.x.max(b2.x);
    let i_xmax = b1.right().min(b2.right());
    let i_ymin = b1.y.max(b2.y);
    let i_ymax = b1.bottom().min(b2.bottom());
    let i_area = (i_xmax - i_xmin).max(0) as f32 * (i_ymax - i_ymin).max(0) as f32;
    let union = b1.area() + b2.area() - i_area;
    if union <= 0. { 0. } else { i_area / union }
}

/// Non-maximum suppression over a list of candidates.
///
/// Candidates scoring below `score_threshold` are discarded up front; the
/// remaining ones are visited in decreasing confidence and kept unless their
/// IoU with an already kept candidate is greater than `nms_threshold`.
/// Suppression is class agnostic.
///
/// # Arguments
///
/// * `candidates` - The decoded candidates.
/// * `score_threshold` - Minimum confidence, inclusive.
/// * `nms_threshold` - The IoU threshold for suppression.
/// * `max_detections` - Maximum number of candidates to keep.
///
/// # Returns
///
/// The indices into `candidates` of the kept candidates, best first.
pub fn non_maximum_suppression(
    candidates: &[Candidate],
    score_threshold: f32,
    nms_threshold: f32,
    max_detections: usize,
) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].confidence >= score_threshold)
        .collect();
    // stable, so equal scores keep their decode order
    idxs.sort_by(|&a, &b| {
        candidates[b]
            .confidence
            .total_cmp(&candidates[a].confidence)
    });

    let mut kept: Vec<usize> = Vec::new();
    for idx in idxs {
        if kept.len() >= max_detections {
            break;
        }
        let current = &candidates[idx].bbox;
        let overlaps = kept
            .iter()
            .any(|&k| iou(&candidates[k].bbox, current) > nms_threshold);
        if !overlaps {
            kept.push(idx);
        }
    }

    kept
}
