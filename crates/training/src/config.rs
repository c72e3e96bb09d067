//! Immutable run configuration.
//!
//! `ModelConfig` is built once by `ModelConfigBuilder` from CLI values, the
//! validated manifest and an optional TOML override file, then shared by
//! reference with every stage.

use burn_dataset::AugmentationPolicy;
use data_contracts::DatasetManifest;
use models::{BackboneConfig, DetectorSpec, LossWeights};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_INPUT_SIZE: usize = 640;
pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const DEFAULT_EPOCHS: usize = 100;
pub const DEFAULT_LEARNING_RATE: f64 = 1e-3;
pub const DEFAULT_MAX_DETECTIONS: usize = 10;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;
pub const DEFAULT_SAVE_PERIOD: usize = 10;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu => write!(f, "gpu"),
        }
    }
}

impl FromStr for Device {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" | "wgpu" => Ok(Device::Gpu),
            other => Err(ConfigError::Invalid(format!(
                "unknown device `{other}` (expected cpu or gpu)"
            ))),
        }
    }
}

/// Configuration shared by every stage. No setters; build a new one instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    input_size: usize,
    num_classes: usize,
    class_names: Vec<String>,
    max_detections: usize,
    confidence_threshold: f32,
    nms_threshold: f32,
    batch_size: usize,
    epochs: usize,
    learning_rate: f64,
    save_period: usize,
    seed: u64,
    cache_images: bool,
    device: Device,
    loss_weights: LossWeights,
    augmentation: AugmentationPolicy,
    backbone: BackboneConfig,
}

impl ModelConfig {
    pub fn input_size(&self) -> usize {
        self.input_size
    }
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }
    pub fn max_detections(&self) -> usize {
        self.max_detections
    }
    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }
    pub fn nms_threshold(&self) -> f32 {
        self.nms_threshold
    }
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
    pub fn epochs(&self) -> usize {
        self.epochs
    }
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
    pub fn save_period(&self) -> usize {
        self.save_period
    }
    pub fn seed(&self) -> u64 {
        self.seed
    }
    /// Keep decoded training images in memory between epochs.
    pub fn cache_images(&self) -> bool {
        self.cache_images
    }
    pub fn device(&self) -> Device {
        self.device
    }
    pub fn loss_weights(&self) -> LossWeights {
        self.loss_weights
    }
    pub fn augmentation(&self) -> &AugmentationPolicy {
        &self.augmentation
    }
    pub fn backbone(&self) -> &BackboneConfig {
        &self.backbone
    }

    /// Architecture request handed to the Model Builder.
    pub fn detector_spec(&self) -> DetectorSpec {
        DetectorSpec::new(self.input_size, self.num_classes, self.max_detections)
            .with_backbone(self.backbone.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.epochs == 0 {
            return invalid("epochs must be at least 1".into());
        }
        if self.batch_size == 0 {
            return invalid("batch size must be at least 1".into());
        }
        if self.num_classes == 0 || self.class_names.len() != self.num_classes {
            return invalid(format!(
                "class count {} does not match {} class names",
                self.num_classes,
                self.class_names.len()
            ));
        }
        if self.max_detections == 0 {
            return invalid("max detections must be at least 1".into());
        }
        if self.input_size < 32 || self.input_size % 32 != 0 {
            return invalid(format!(
                "input size {} must be a multiple of 32 and at least 32",
                self.input_size
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning rate {} must be positive", self.learning_rate));
        }
        if self.save_period == 0 {
            return invalid("save period must be at least 1".into());
        }
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("nms_threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} {value} is outside [0, 1]"));
            }
        }
        let aug = &self.augmentation;
        for (name, value) in [
            ("flip_horizontal_prob", aug.flip_horizontal_prob),
            ("mosaic_prob", aug.mosaic_prob),
            ("mixup_prob", aug.mixup_prob),
            ("copy_paste_prob", aug.copy_paste_prob),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} {value} is outside [0, 1]"));
            }
        }
        for (name, value) in [
            ("rotation_degrees", aug.rotation_degrees),
            ("zoom", aug.zoom),
            ("translate", aug.translate),
            ("brightness", aug.brightness),
            ("contrast", aug.contrast),
            ("hue", aug.hue),
            ("saturation", aug.saturation),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{name} {value} must be a non-negative number"));
            }
        }
        if aug.zoom >= 1.0 || aug.translate >= 1.0 || aug.hue > 0.5 {
            return invalid("zoom and translate must be below 1.0, hue at most 0.5".into());
        }
        for (name, value) in [
            ("loss.boxes", self.loss_weights.boxes),
            ("loss.confidence", self.loss_weights.confidence),
            ("loss.classes", self.loss_weights.classes),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{name} {value} must be a non-negative number"));
            }
        }
        self.detector_spec().validate().map_err(ConfigError::Invalid)
    }
}

/// TOML override file; every key optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub training: Option<TrainingSection>,
    pub detection: Option<DetectionSection>,
    pub loss: Option<LossSection>,
    pub augmentation: Option<AugmentationSection>,
    pub backbone: Option<BackboneSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingSection {
    pub epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub learning_rate: Option<f64>,
    pub save_period: Option<usize>,
    pub seed: Option<u64>,
    pub cache_images: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionSection {
    pub input_size: Option<usize>,
    pub max_detections: Option<usize>,
    pub confidence_threshold: Option<f32>,
    pub nms_threshold: Option<f32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossSection {
    pub boxes: Option<f32>,
    pub confidence: Option<f32>,
    pub classes: Option<f32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AugmentationSection {
    pub rotation_degrees: Option<f32>,
    pub zoom: Option<f32>,
    pub translate: Option<f32>,
    pub flip_horizontal_prob: Option<f32>,
    pub brightness: Option<f32>,
    pub contrast: Option<f32>,
    pub hue: Option<f32>,
    pub saturation: Option<f32>,
    pub mosaic_prob: Option<f32>,
    pub mixup_prob: Option<f32>,
    pub copy_paste_prob: Option<f32>,
    /// Turn every augmentation off before applying the keys above.
    pub disabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackboneSection {
    pub widths: Option<Vec<usize>>,
}

impl ConfigOverrides {
    pub fn from_toml_str(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw, path)
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfigBuilder {
    config: ModelConfig,
}

impl ModelConfigBuilder {
    /// Start from defaults with the class set of a validated manifest.
    pub fn new(manifest: &DatasetManifest) -> Self {
        Self::with_classes(manifest.class_names.clone())
    }

    pub fn with_classes(class_names: Vec<String>) -> Self {
        Self {
            config: ModelConfig {
                input_size: DEFAULT_INPUT_SIZE,
                num_classes: class_names.len(),
                class_names,
                max_detections: DEFAULT_MAX_DETECTIONS,
                confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
                nms_threshold: DEFAULT_NMS_THRESHOLD,
                batch_size: DEFAULT_BATCH_SIZE,
                epochs: DEFAULT_EPOCHS,
                learning_rate: DEFAULT_LEARNING_RATE,
                save_period: DEFAULT_SAVE_PERIOD,
                seed: DEFAULT_SEED,
                cache_images: true,
                device: Device::Cpu,
                loss_weights: LossWeights::default(),
                augmentation: AugmentationPolicy::default(),
                backbone: BackboneConfig::default(),
            },
        }
    }

    pub fn input_size(mut self, value: usize) -> Self {
        self.config.input_size = value;
        self
    }
    pub fn batch_size(mut self, value: usize) -> Self {
        self.config.batch_size = value;
        self
    }
    pub fn epochs(mut self, value: usize) -> Self {
        self.config.epochs = value;
        self
    }
    pub fn device(mut self, value: Device) -> Self {
        self.config.device = value;
        self
    }
    pub fn seed(mut self, value: u64) -> Self {
        self.config.seed = value;
        self
    }
    pub fn max_detections(mut self, value: usize) -> Self {
        self.config.max_detections = value;
        self
    }
    pub fn learning_rate(mut self, value: f64) -> Self {
        self.config.learning_rate = value;
        self
    }
    pub fn save_period(mut self, value: usize) -> Self {
        self.config.save_period = value;
        self
    }
    pub fn cache_images(mut self, value: bool) -> Self {
        self.config.cache_images = value;
        self
    }
    pub fn augmentation(mut self, value: AugmentationPolicy) -> Self {
        self.config.augmentation = value;
        self
    }
    pub fn backbone(mut self, value: BackboneConfig) -> Self {
        self.config.backbone = value;
        self
    }

    /// Apply a TOML override file on top of the values set so far.
    pub fn overrides(mut self, file: ConfigOverrides) -> Self {
        let cfg = &mut self.config;
        if let Some(t) = file.training {
            cfg.epochs = t.epochs.unwrap_or(cfg.epochs);
            cfg.batch_size = t.batch_size.unwrap_or(cfg.batch_size);
            cfg.learning_rate = t.learning_rate.unwrap_or(cfg.learning_rate);
            cfg.save_period = t.save_period.unwrap_or(cfg.save_period);
            cfg.seed = t.seed.unwrap_or(cfg.seed);
            cfg.cache_images = t.cache_images.unwrap_or(cfg.cache_images);
        }
        if let Some(d) = file.detection {
            cfg.input_size = d.input_size.unwrap_or(cfg.input_size);
            cfg.max_detections = d.max_detections.unwrap_or(cfg.max_detections);
            cfg.confidence_threshold = d.confidence_threshold.unwrap_or(cfg.confidence_threshold);
            cfg.nms_threshold = d.nms_threshold.unwrap_or(cfg.nms_threshold);
        }
        if let Some(l) = file.loss {
            let w = &mut cfg.loss_weights;
            w.boxes = l.boxes.unwrap_or(w.boxes);
            w.confidence = l.confidence.unwrap_or(w.confidence);
            w.classes = l.classes.unwrap_or(w.classes);
        }
        if let Some(a) = file.augmentation {
            if a.disabled.unwrap_or(false) {
                cfg.augmentation = AugmentationPolicy::disabled();
            }
            let p = &mut cfg.augmentation;
            p.rotation_degrees = a.rotation_degrees.unwrap_or(p.rotation_degrees);
            p.zoom = a.zoom.unwrap_or(p.zoom);
            p.translate = a.translate.unwrap_or(p.translate);
            p.flip_horizontal_prob = a.flip_horizontal_prob.unwrap_or(p.flip_horizontal_prob);
            p.brightness = a.brightness.unwrap_or(p.brightness);
            p.contrast = a.contrast.unwrap_or(p.contrast);
            p.hue = a.hue.unwrap_or(p.hue);
            p.saturation = a.saturation.unwrap_or(p.saturation);
            p.mosaic_prob = a.mosaic_prob.unwrap_or(p.mosaic_prob);
            p.mixup_prob = a.mixup_prob.unwrap_or(p.mixup_prob);
            p.copy_paste_prob = a.copy_paste_prob.unwrap_or(p.copy_paste_prob);
        }
        if let Some(widths) = file.backbone.and_then(|b| b.widths) {
            cfg.backbone = BackboneConfig { widths };
        }
        self
    }

    pub fn build(self) -> Result<ModelConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
