use candle_core::{DType, Tensor};

use crate::{
    bounding_box::{BoundingBox, Candidate},
    error::DetectError,
};

/// Columns before the class scores: center x, center y, width, height, objectness.
pub const ROW_GEOMETRY_COLS: usize = 5;

/// Decode the raw network outputs into candidates.
///
/// Every tensor must be 2-D with one candidate per row laid out as
/// `[cx, cy, w, h, objectness, class scores...]`, geometry normalized to the
/// network input. Boxes are scaled back to the original frame size. Rows are
/// neither filtered nor reordered.
///
/// # Arguments
///
/// * `outputs` - The output tensors, one per detection head.
/// * `frame_width` - Width in pixels of the original frame.
/// * `frame_height` - Height in pixels of the original frame.
pub fn decode_outputs(
    outputs: &[Tensor],
    frame_width: usize,
    frame_height: usize,
) -> Result<Vec<Candidate>, DetectError> {
    let mut candidates = Vec::new();
    for (index, out) in outputs.iter().enumerate() {
        let dims = out.dims();
        if dims.len() != 2 || dims[1] < ROW_GEOMETRY_COLS {
            return Err(DetectError::InvalidTensorShape(format!(
                "output {index} has shape {dims:?}, expected [rows, >= {ROW_GEOMETRY_COLS}]"
            )));
        }
        let rows = out.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        candidates.extend(
            rows.iter()
                .map(|row| decode_row(row, frame_width as f32, frame_height as f32)),
        );
    }
    Ok(candidates)
}

fn decode_row(row: &[f32], frame_width: f32, frame_height: f32) -> Candidate {
    let (class_id, confidence) = row[ROW_GEOMETRY_COLS..]
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, score)| match best {
            Some((_, max)) if max >= score => best,
            _ => Some((i, score)),
        })
        .unwrap_or((0, 0.0));

    let center_x = (row[0] * frame_width) as i32;
    let center_y = (row[1] * frame_height) as i32;
    let width = (row[2] * frame_width) as i32;
    let height = (row[3] * frame_height) as i32;

    Candidate {
        bbox: BoundingBox::new(center_x - width / 2, center_y - height / 2, width, height),
        class_id,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(rows: &[&[f32]]) -> Result<Tensor, candle_core::Error> {
        let cols = rows.first().map_or(0, |r| r.len());
        let data: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(data, (rows.len(), cols), &Device::Cpu)
    }

    #[test]
    fn test_box_geometry() -> Result<(), Box<dyn std::error::Error>> {
        let out = tensor(&[&[0.5, 0.5, 0.2, 0.2, 1.0, 0.7]])?;
        let candidates = decode_outputs(&[out], 100, 100)?;
        assert_eq!(candidates[0].bbox, BoundingBox::new(40, 40, 20, 20));
        Ok(())
    }

    #[test]
    fn test_independent_axis_scaling() -> Result<(), Box<dyn std::error::Error>> {
        let out = tensor(&[&[0.5, 0.5, 0.5, 0.5, 1.0, 0.7]])?;
        let candidates = decode_outputs(&[out], 200, 100)?;
        assert_eq!(candidates[0].bbox, BoundingBox::new(50, 25, 100, 50));
        Ok(())
    }

    #[test]
    fn test_confidence_selection() -> Result<(), Box<dyn std::error::Error>> {
        // objectness in column 4 is ignored
        let out = tensor(&[&[0.5, 0.5, 0.2, 0.2, 0.99, 0.1, 0.9, 0.3]])?;
        let candidates = decode_outputs(&[out], 100, 100)?;
        assert_eq!(candidates[0].class_id, 1);
        assert_eq!(candidates[0].confidence, 0.9);
        Ok(())
    }

    #[test]
    fn test_rows_are_kept_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let a = tensor(&[
            &[0.1, 0.1, 0.1, 0.1, 0.0, 0.0, 0.0],
            &[0.2, 0.2, 0.1, 0.1, 0.0, 0.0, 0.0],
        ])?;
        let b = tensor(&[&[0.3, 0.3, 0.1, 0.1, 0.0, 0.0, 0.0]])?;
        let candidates = decode_outputs(&[a, b], 100, 100)?;
        assert_eq!(candidates.len(), 3);
        let xs: Vec<i32> = candidates.iter().map(|c| c.bbox.x).collect();
        assert_eq!(xs, vec![5, 15, 25]);
        Ok(())
    }

    #[test]
    fn test_no_class_scores() -> Result<(), Box<dyn std::error::Error>> {
        let out = tensor(&[&[0.5, 0.5, 0.2, 0.2, 1.0]])?;
        let candidates = decode_outputs(&[out], 100, 100)?;
        assert_eq!(candidates[0].class_id, 0);
        assert_eq!(candidates[0].confidence, 0.0);
        Ok(())
    }

    #[test]
    fn test_empty() -> Result<(), Box<dyn std::error::Error>> {
        assert!(decode_outputs(&[], 100, 100)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_invalid_shape() -> Result<(), Box<dyn std::error::Error>> {
        let narrow = tensor(&[&[0.5, 0.5, 0.2, 0.2]])?;
        assert!(matches!(
            decode_outputs(&[narrow], 100, 100),
            Err(DetectError::InvalidTensorShape(_))
        ));
        let flat = Tensor::zeros(12, DType::F32, &Device::Cpu)?;
        assert!(matches!(
            decode_outputs(&[flat], 100, 100),
            Err(DetectError::InvalidTensorShape(_))
        ));
        Ok(())
    }
}
