#![deny(missing_docs)]

//! Darknet YOLO object detection in Rust
//!
//! This crate loads a Darknet network (`.cfg` + `.weights`) on candle, runs it
//! on a single image, suppresses overlapping boxes and draws the survivors.
//!
//! # Examples
//!
//! ```no_run
//! use kornia_darknet::{DetectorConfig, run};
//!
//! let config = DetectorConfig {
//!     network: "yolov4-tiny".to_string(),
//!     image_path: "path/to/image.jpg".into(),
//!     ..Default::default()
//! };
//!
//! let report = run(&config).expect("Failed to run detection");
//! println!("Detections: {:?}", report.detections);
//! ```

/// Bounding boxes and non-maximum suppression
mod bounding_box;

/// Darknet config file parser
mod cfg;

/// Network output decoding
mod decode;

/// High level detector interface
mod detector;

/// Error type
mod error;

/// Bitmap font for labels
mod font;

/// Darknet network definition in candle
mod model;

/// Load, detect, render and write
mod pipeline;

/// Suppression and drawing
mod render;

/// Darknet weights reader
mod weights;

pub use bounding_box::{BoundingBox, Candidate, iou, non_maximum_suppression};
pub use cfg::{DarknetConfig, Section};
pub use decode::{ROW_GEOMETRY_COLS, decode_outputs};
pub use detector::{Detector, DetectorConfig, load_class_names};
pub use error::DetectError;
pub use model::Darknet;
pub use pipeline::{Report, detect, read_image, run};
pub use render::{KeptDetections, SuppressionParams, class_label, suppress_and_render};
pub use weights::WeightsReader;
