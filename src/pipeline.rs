use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use image::RgbImage;
use kornia_image::{Image, ImageSize};

use crate::{
    detector::{Detector, DetectorConfig},
    error::DetectError,
    render::{KeptDetections, suppress_and_render},
};

/// Outcome of a single detection run.
#[derive(Debug, Clone)]
pub struct Report {
    /// Time spent preprocessing, in the network and in post-processing.
    pub elapsed: Duration,
    /// The detections drawn onto the output image.
    pub detections: KeptDetections,
    /// Where the annotated image was written.
    pub output_path: PathBuf,
}

impl Report {
    /// The kept detections as a JSON string.
    pub fn detections_json(&self) -> Result<String, DetectError> {
        Ok(serde_json::to_string(&self.detections)?)
    }
}

/// Decode an image file as rgb8.
pub fn read_image(path: &Path) -> Result<RgbImage, DetectError> {
    if !path.exists() {
        return Err(DetectError::FileNotFound(path.to_path_buf()));
    }
    let image = image::open(path).map_err(|e| DetectError::ImageDecodeFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(image.to_rgb8())
}

fn to_kornia(image: &RgbImage) -> Result<Image<u8, 3>, DetectError> {
    let size = ImageSize {
        width: image.width() as usize,
        height: image.height() as usize,
    };
    Ok(Image::new(size, image.as_raw().clone())?)
}

/// Run the detector on `image`, drawing the kept detections in place.
pub fn detect(
    detector: &Detector,
    image: &mut RgbImage,
    config: &DetectorConfig,
) -> Result<KeptDetections, DetectError> {
    let frame = to_kornia(image)?;
    let candidates = detector.inference(&frame)?;
    Ok(suppress_and_render(
        image,
        &candidates,
        detector.classes(),
        config.suppression(),
    ))
}

/// Load the network, detect on the configured image and write the result.
pub fn run(config: &DetectorConfig) -> Result<Report, DetectError> {
    let detector = Detector::new(config)?;
    let mut image = read_image(&config.image_path)?;
    tracing::debug!(
        width = image.width(),
        height = image.height(),
        "read input image"
    );

    let start = Instant::now();
    let detections = detect(&detector, &mut image, config)?;
    let elapsed = start.elapsed();

    image.save(&config.output_path)?;
    tracing::info!(
        detections = detections.len(),
        output = %config.output_path.display(),
        "wrote annotated image"
    );

    Ok(Report {
        elapsed,
        detections,
        output_path: config.output_path.clone(),
    })
}
