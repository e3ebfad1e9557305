use argh::FromArgs;
use std::{path::PathBuf, process::ExitCode};
use tracing_subscriber::EnvFilter;

use kornia_darknet::{DetectError, DetectorConfig, run};

#[derive(FromArgs)]
/// Darknet YOLO detection on a single image
struct Args {
    /// network name, read from <assets>/<net>.cfg and <assets>/<net>.weights
    #[argh(option)]
    net: String,

    /// square network input size
    #[argh(option, default = "416")]
    size: usize,

    /// the score threshold
    #[argh(option, default = "0.45")]
    thresh: f32,

    /// the nms threshold
    #[argh(option, default = "0.8")]
    nms: f32,

    /// path to an input image
    #[argh(option)]
    image: PathBuf,

    /// directory with the network files and class names
    #[argh(option, default = "PathBuf::from(\"assets\")")]
    assets: PathBuf,

    /// class names file inside the assets directory
    #[argh(option, default = "\"coco.names\".to_string()")]
    names: String,

    /// path of the annotated output image
    #[argh(option, default = "PathBuf::from(\"result.jpg\")")]
    output: PathBuf,

    /// maximum number of kept detections
    #[argh(option, default = "100")]
    max_detections: usize,

    /// run on cuda:0 when available
    #[argh(switch)]
    gpu: bool,

    /// also print the detections as json
    #[argh(switch)]
    json: bool,
}

impl From<Args> for DetectorConfig {
    fn from(args: Args) -> Self {
        Self {
            network: args.net,
            input_size: args.size,
            score_threshold: args.thresh,
            nms_threshold: args.nms,
            image_path: args.image,
            assets_dir: args.assets,
            names_file: args.names,
            output_path: args.output,
            max_detections: args.max_detections,
            use_cpu: !args.gpu,
        }
    }
}

fn try_main(args: Args) -> Result<(), DetectError> {
    let json = args.json;
    let report = run(&args.into())?;

    println!("Time taken: {:?}", report.elapsed);
    println!("Detected classes: {:?}", report.detections.class_names);
    println!("Detected confidences: {:?}", report.detections.confidences);
    if json {
        println!("{}", report.detections_json()?);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kornia_darknet=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match try_main(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
