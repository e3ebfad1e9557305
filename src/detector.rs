use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use kornia_image::{Image, ImageSize};

use super::{
    bounding_box::Candidate,
    cfg::DarknetConfig,
    decode::decode_outputs,
    error::DetectError,
    model::Darknet,
    render::SuppressionParams,
    weights::WeightsReader,
};

/// Detector configuration struct.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Network name, resolving `<assets_dir>/<network>.cfg` and `.weights`.
    pub network: String,
    /// Square network input resolution, a multiple of 32.
    pub input_size: usize,
    /// Minimum confidence of a kept detection.
    pub score_threshold: f32,
    /// IoU threshold for non-maximum suppression.
    pub nms_threshold: f32,
    /// Input image.
    pub image_path: PathBuf,
    /// Directory holding the network files and the class names.
    pub assets_dir: PathBuf,
    /// Class names file, relative to `assets_dir`.
    pub names_file: String,
    /// Annotated output image.
    pub output_path: PathBuf,
    /// Maximum number of detections kept by the suppression.
    pub max_detections: usize,
    /// Whether to use the CPU or GPU
    pub use_cpu: bool,
}

/// Default configuration for the detector.
impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            network: "yolov4".to_string(),
            input_size: 416,
            score_threshold: 0.45,
            nms_threshold: 0.8,
            image_path: PathBuf::new(),
            assets_dir: PathBuf::from("assets"),
            names_file: "coco.names".to_string(),
            output_path: PathBuf::from("result.jpg"),
            max_detections: 100,
            use_cpu: true,
        }
    }
}

impl DetectorConfig {
    /// Path of the Darknet `.cfg` file.
    pub fn cfg_path(&self) -> PathBuf {
        self.assets_dir.join(format!("{}.cfg", self.network))
    }

    /// Path of the Darknet `.weights` file.
    pub fn weights_path(&self) -> PathBuf {
        self.assets_dir.join(format!("{}.weights", self.network))
    }

    /// Path of the class names file.
    pub fn names_path(&self) -> PathBuf {
        self.assets_dir.join(&self.names_file)
    }

    /// The suppression parameters of this configuration.
    pub fn suppression(&self) -> SuppressionParams {
        SuppressionParams {
            score_threshold: self.score_threshold,
            nms_threshold: self.nms_threshold,
            max_detections: self.max_detections,
        }
    }

    /// Check the values that do not depend on the filesystem.
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.network.is_empty() {
            return Err(DetectError::InvalidConfig("network name is empty".to_string()));
        }
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(DetectError::InvalidConfig(format!(
                "input size {} is not a positive multiple of 32",
                self.input_size
            )));
        }
        for (name, value) in [
            ("score threshold", self.score_threshold),
            ("nms threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DetectError::InvalidConfig(format!(
                    "{name} {value} is outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Read a class names file, one name per line.
///
/// Trailing blank lines are dropped; interior lines keep their position so
/// that line `n` names class `n`.
pub fn load_class_names(path: impl AsRef<Path>) -> Result<Vec<String>, DetectError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| DetectError::from_io(e, path))?;
    let mut names: Vec<String> = text.lines().map(|l| l.trim().to_string()).collect();
    while names.last().is_some_and(|n| n.is_empty()) {
        names.pop();
    }
    Ok(names)
}

/// Darknet detector high level interface.
pub struct Detector {
    input_size: usize,
    device: Device,
    network: Darknet,
    classes: Vec<String>,
}

impl Detector {
    /// Load the class names and the network described by `config`.
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectError> {
        config.validate()?;
        let device = if config.use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)
                .map_err(|_| DetectError::InvalidConfig("cuda:0 error".to_string()))?
        };

        let classes = load_class_names(config.names_path())?;
        let network = Self::load_network(config, &device)?;
        tracing::info!(
            network = %config.network,
            heads = network.num_heads(),
            classes = classes.len(),
            "network loaded"
        );
        if network.num_classes() > classes.len() {
            tracing::warn!(
                network_classes = network.num_classes(),
                names = classes.len(),
                "fewer class names than network classes"
            );
        }

        Ok(Self::from_parts(config.input_size, device, network, classes))
    }

    /// Assemble a detector from an already built network.
    pub fn from_parts(
        input_size: usize,
        device: Device,
        network: Darknet,
        classes: Vec<String>,
    ) -> Self {
        Self {
            input_size,
            device,
            network,
            classes,
        }
    }

    /// The class names, indexed by class id.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Run the network on an rgb8 image and decode every candidate.
    ///
    /// Candidate boxes are in pixels of `image`.
    pub fn inference(&self, image: &Image<u8, 3>) -> Result<Vec<Candidate>, DetectError> {
        // preprocess the image
        let image_t = self.preprocess_image(image)?;

        // forward the image
        let outputs = self.network.forward(&image_t)?;

        let candidates = decode_outputs(&outputs, image.width(), image.height())?;
        tracing::debug!(
            outputs = outputs.len(),
            candidates = candidates.len(),
            "decoded network outputs"
        );
        Ok(candidates)
    }

    fn preprocess_image(&self, image: &Image<u8, 3>) -> Result<Tensor, DetectError> {
        let size = self.input_size;
        let mut image_resized = Image::from_size_val(
            ImageSize {
                width: size,
                height: size,
            },
            0,
        )?;
        kornia_imgproc::resize::resize_fast(
            image,
            &mut image_resized,
            kornia_imgproc::interpolation::InterpolationMode::Bilinear,
        )?;

        let data: Vec<f32> = image_resized
            .as_slice()
            .iter()
            .map(|&x| x as f32 / 255.0)
            .collect();

        let image_t = Tensor::from_vec(data, (size, size, 3), &self.device)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?;

        Ok(image_t)
    }

    fn load_network(config: &DetectorConfig, device: &Device) -> Result<Darknet, DetectError> {
        let cfg_path = config.cfg_path();
        let weights_path = config.weights_path();
        for path in [&cfg_path, &weights_path] {
            if !path.exists() {
                return Err(DetectError::FileNotFound(path.clone()));
            }
        }

        let cfg = DarknetConfig::from_file(&cfg_path)?;
        let mut weights = WeightsReader::from_file(&weights_path)?;
        tracing::debug!(
            layers = cfg.layers.len(),
            version = ?weights.version(),
            parameters = weights.remaining(),
            "read darknet files"
        );
        let network = Darknet::new(&cfg, &mut weights, device)?;
        if network.channels() != 3 {
            return Err(DetectError::InvalidConfig(format!(
                "network expects {} input channels, only rgb is supported",
                network.channels()
            )));
        }
        Ok(network)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::weights::weights_bytes;

    /// One 1x1 conv feeding a 2-class single-anchor yolo head.
    pub(crate) const TEST_CFG: &str = "
[net]
width=32
height=32
channels=3

[convolutional]
filters=7
size=1
stride=32
activation=linear

[yolo]
mask=0
anchors=16,16
classes=2
num=1
";

    /// Biases chosen so every cell predicts a centered box of class 1.
    pub(crate) fn test_weights() -> Vec<u8> {
        // tx, ty, tw, th, objectness, class 0, class 1
        let mut values = vec![0.0, 0.0, 0.0, 0.0, 10.0, -10.0, 10.0];
        values.extend(std::iter::repeat_n(0.0, 7 * 3));
        weights_bytes((0, 2, 0), &values)
    }

    pub(crate) fn write_assets(dir: &Path) -> Result<(), std::io::Error> {
        std::fs::write(dir.join("tiny.cfg"), TEST_CFG)?;
        std::fs::write(dir.join("tiny.weights"), test_weights())?;
        std::fs::write(dir.join("coco.names"), "person\nbicycle\n\n")
    }

    pub(crate) fn test_config(dir: &Path) -> DetectorConfig {
        DetectorConfig {
            network: "tiny".to_string(),
            input_size: 64,
            assets_dir: dir.to_path_buf(),
            image_path: dir.join("input.png"),
            output_path: dir.join("result.jpg"),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(DetectorConfig::default().validate().is_ok());
        for config in [
            DetectorConfig {
                input_size: 100,
                ..Default::default()
            },
            DetectorConfig {
                score_threshold: 1.5,
                ..Default::default()
            },
            DetectorConfig {
                network: String::new(),
                ..Default::default()
            },
        ] {
            assert!(matches!(config.validate(), Err(DetectError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_paths() {
        let config = DetectorConfig {
            network: "yolov4-tiny".to_string(),
            ..Default::default()
        };
        assert_eq!(config.cfg_path(), Path::new("assets/yolov4-tiny.cfg"));
        assert_eq!(config.weights_path(), Path::new("assets/yolov4-tiny.weights"));
        assert_eq!(config.names_path(), Path::new("assets/coco.names"));
    }

    #[test]
    fn test_load_class_names() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("names");
        std::fs::write(&path, "person\n\ncar\r\n\n\n")?;
        assert_eq!(load_class_names(&path)?, vec!["person", "", "car"]);
        assert!(matches!(
            load_class_names(dir.path().join("missing")),
            Err(DetectError::FileNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_missing_network_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        write_assets(dir.path())?;
        std::fs::remove_file(dir.path().join("tiny.weights"))?;
        match Detector::new(&test_config(dir.path())) {
            Err(DetectError::FileNotFound(path)) => assert!(path.ends_with("tiny.weights")),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        Ok(())
    }

    #[test]
    fn test_inference() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        write_assets(dir.path())?;
        let detector = Detector::new(&test_config(dir.path()))?;
        assert_eq!(detector.classes(), &["person", "bicycle"]);

        let image = Image::<u8, 3>::from_size_val(
            ImageSize {
                width: 100,
                height: 50,
            },
            128,
        )?;
        let candidates = detector.inference(&image)?;
        // stride 32 on a 64 input: 2x2 cells, one anchor each
        assert_eq!(candidates.len(), 4);
        for candidate in &candidates {
            assert_eq!(candidate.class_id, 1);
            assert!(candidate.confidence > 0.99);
        }
        // anchor 16 on a 64 input is a quarter of the frame
        assert_eq!(candidates[0].bbox.width, 25);
        assert_eq!(candidates[0].bbox.height, 12);
        Ok(())
    }
}
