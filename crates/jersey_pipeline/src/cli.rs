use clap::Parser;
use models::HeadKind;
use std::path::PathBuf;
use training::Device;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "train_jersey",
    about = "Validate a jersey-number dataset, train a detector and export it for mobile"
)]
pub struct TrainJerseyArgs {
    /// Dataset manifest (YAML with train, val, nc, names).
    #[arg(long)]
    pub data: PathBuf,
    /// Square input resolution; a multiple of 32.
    #[arg(long, default_value_t = 640)]
    pub img: usize,
    /// Batch size.
    #[arg(long, default_value_t = 16)]
    pub batch: usize,
    /// Number of epochs.
    #[arg(long, default_value_t = 100)]
    pub epochs: usize,
    /// Compute device (cpu or gpu; gpu needs the backend-wgpu feature).
    #[arg(long, default_value = "cpu")]
    pub device: Device,
    /// Parent directory for runs.
    #[arg(long, default_value = "runs/train")]
    pub project: PathBuf,
    /// Run name under the project directory.
    #[arg(long, default_value = "jersey_detector")]
    pub name: String,
    /// Pretrained single-stage checkpoint; switches to fine-tuning.
    #[arg(long)]
    pub pretrained: Option<PathBuf>,
    /// Backbone weights for a detector built without --pretrained.
    #[arg(long)]
    pub backbone_weights: Option<PathBuf>,
    /// Head built without --pretrained (custom_head or single_stage). A
    /// single_stage run's last.bin can seed a later --pretrained run.
    #[arg(long, default_value = "custom_head", conflicts_with = "pretrained")]
    pub head: HeadKind,
    /// TOML file with hyperparameter and augmentation overrides.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Export formats, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "quantized,interchange")]
    pub formats: Vec<String>,
    /// Training images used to calibrate quantization.
    #[arg(long, default_value_t = export::DEFAULT_CALIBRATION_SAMPLES)]
    pub calibration_samples: usize,
    /// Detection slots per image.
    #[arg(long, default_value_t = 10)]
    pub max_detections: usize,
    /// Seed for shuffling and augmentation.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Debug-level logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl TrainJerseyArgs {
    /// `<project>/<name>`
    pub fn run_dir(&self) -> PathBuf {
        self.project.join(&self.name)
    }
}
