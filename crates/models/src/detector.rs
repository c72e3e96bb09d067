//! The jersey-number detector: one backbone and exactly one of two heads.
//!
//! Output contract, identical for both heads:
//! - boxes: `[B, max_det, 4]` corner form in `[0, 1]`, `x0 <= x1`, `y0 <= y1`
//! - confidence: `[B, max_det]` in `[0, 1]`
//! - class_probs: `[B, max_det, nc]`, each slot sums to 1

use burn::module::{Ignored, Module};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::backbone::{Backbone, BackboneConfig};
use crate::custom_head::CustomHead;
use crate::single_stage::GridHead;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadKind {
    CustomHead,
    SingleStage,
}

impl HeadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeadKind::CustomHead => "custom_head",
            HeadKind::SingleStage => "single_stage",
        }
    }
}

impl FromStr for HeadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "custom_head" | "custom" => Ok(HeadKind::CustomHead),
            "single_stage" => Ok(HeadKind::SingleStage),
            other => Err(format!(
                "unknown head '{other}', expected custom_head or single_stage"
            )),
        }
    }
}

/// What to build: input resolution, class set size and slot count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSpec {
    pub input_size: usize,
    pub num_classes: usize,
    pub max_detections: usize,
    #[serde(default)]
    pub backbone: BackboneConfig,
    #[serde(default = "default_hidden")]
    pub hidden: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
}

fn default_hidden() -> usize {
    512
}

fn default_dropout() -> f64 {
    0.3
}

impl DetectorSpec {
    pub fn new(input_size: usize, num_classes: usize, max_detections: usize) -> Self {
        Self {
            input_size,
            num_classes,
            max_detections,
            backbone: BackboneConfig::default(),
            hidden: default_hidden(),
            dropout: default_dropout(),
        }
    }

    pub fn with_backbone(mut self, backbone: BackboneConfig) -> Self {
        self.backbone = backbone;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.num_classes == 0 {
            return Err("num_classes must be at least 1".into());
        }
        if self.max_detections == 0 {
            return Err("max_detections must be at least 1".into());
        }
        if self.backbone.widths.is_empty() || self.backbone.widths.contains(&0) {
            return Err("backbone needs at least one block of non-zero width".into());
        }
        if self.input_size < self.backbone.stride() {
            return Err(format!(
                "input size {} is smaller than the backbone stride {}",
                self.input_size,
                self.backbone.stride()
            ));
        }
        if self.hidden == 0 || !(0.0..1.0).contains(&self.dropout) {
            return Err("hidden width must be positive and dropout in [0, 1)".into());
        }
        Ok(())
    }
}

/// Persisted next to every checkpoint so it can be rebuilt without a config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub head: HeadKind,
    #[serde(flatten)]
    pub spec: DetectorSpec,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("architecture sidecar {path} is invalid: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint record {path} could not be used: {reason}")]
    Record { path: PathBuf, reason: String },
}

/// `<record>.json` next to a `<record>.bin` checkpoint.
pub fn sidecar_path(record: &Path) -> PathBuf {
    record.with_extension("json")
}

pub fn read_architecture(record: &Path) -> Result<ArchitectureSpec, CheckpointError> {
    let path = sidecar_path(record);
    let raw = fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| CheckpointError::Sidecar { path, source })
}

/// One decoded detection slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    /// Confidence times the winning class probability.
    pub score: f32,
    pub class_id: u32,
}

#[derive(Debug, Clone)]
pub struct DetectionOutput<B: Backend> {
    pub boxes: Tensor<B, 3>,
    pub confidence: Tensor<B, 2>,
    pub class_probs: Tensor<B, 3>,
}

impl<B: Backend> DetectionOutput<B> {
    /// Decode every slot of every image, highest class per slot.
    pub fn detections(&self) -> Vec<Vec<Detection>> {
        let [batch, slots, nc] = self.class_probs.dims();
        let boxes = self
            .boxes
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        let conf = self
            .confidence
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        let probs = self
            .class_probs
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        if boxes.len() < batch * slots * 4
            || conf.len() < batch * slots
            || probs.len() < batch * slots * nc
        {
            return vec![Vec::new(); batch];
        }
        (0..batch)
            .map(|b| {
                (0..slots)
                    .map(|s| {
                        let slot = b * slots + s;
                        let row = &probs[slot * nc..(slot + 1) * nc];
                        let (class_id, best) = row.iter().copied().enumerate().fold(
                            (0usize, f32::MIN),
                            |acc, (i, p)| if p > acc.1 { (i, p) } else { acc },
                        );
                        Detection {
                            bbox: [
                                boxes[slot * 4],
                                boxes[slot * 4 + 1],
                                boxes[slot * 4 + 2],
                                boxes[slot * 4 + 3],
                            ],
                            score: conf[slot] * best,
                            class_id: class_id as u32,
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

#[derive(Module, Debug)]
pub struct JerseyDetector<B: Backend> {
    pub(crate) backbone: Backbone<B>,
    pub(crate) custom_head: Option<CustomHead<B>>,
    pub(crate) grid_head: Option<GridHead<B>>,
    pub architecture: Ignored<ArchitectureSpec>,
}

impl<B: Backend> JerseyDetector<B> {
    pub fn new(arch: &ArchitectureSpec, device: &B::Device) -> Self {
        let spec = &arch.spec;
        let channels = spec.backbone.out_channels();
        let backbone = Backbone::new(&spec.backbone, device);
        let (custom_head, grid_head) = match arch.head {
            HeadKind::CustomHead => (
                Some(CustomHead::new(
                    channels,
                    spec.hidden,
                    spec.dropout,
                    spec.max_detections,
                    spec.num_classes,
                    device,
                )),
                None,
            ),
            HeadKind::SingleStage => (
                None,
                Some(GridHead::new(
                    channels,
                    spec.max_detections,
                    spec.num_classes,
                    device,
                )),
            ),
        };
        Self {
            backbone,
            custom_head,
            grid_head,
            architecture: Ignored(arch.clone()),
        }
    }

    pub fn architecture(&self) -> &ArchitectureSpec {
        &self.architecture.0
    }

    pub fn head_kind(&self) -> HeadKind {
        self.architecture.0.head
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> DetectionOutput<B> {
        let features = self.backbone.forward(images);
        match (&self.custom_head, &self.grid_head) {
            (Some(head), _) => head.forward(features),
            (None, Some(head)) => head.forward(features),
            (None, None) => unreachable!("detector constructed without a head"),
        }
    }

    pub(crate) fn with_backbone(mut self, backbone: Backbone<B>) -> Self {
        self.backbone = backbone;
        self
    }

    pub(crate) fn into_backbone(self) -> Backbone<B> {
        self.backbone
    }

    /// Point the class head at a new class set; other weights are kept.
    pub fn retarget(mut self, num_classes: usize, device: &B::Device) -> Self {
        let mut arch = self.architecture.0.clone();
        arch.spec.num_classes = num_classes;
        if let Some(head) = self.grid_head.take() {
            self.grid_head = Some(head.retarget(num_classes, device));
        }
        if self.custom_head.is_some() {
            self.custom_head = Some(CustomHead::new(
                arch.spec.backbone.out_channels(),
                arch.spec.hidden,
                arch.spec.dropout,
                arch.spec.max_detections,
                num_classes,
                device,
            ));
        }
        self.architecture = Ignored(arch);
        self
    }

    /// Save `<path>` (burn record) and its architecture sidecar.
    pub fn save_checkpoint(&self, path: &Path) -> Result<(), CheckpointError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(path, &recorder)
            .map_err(|e| CheckpointError::Record {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let sidecar = sidecar_path(path);
        let json = serde_json::to_string_pretty(self.architecture()).map_err(|source| {
            CheckpointError::Sidecar {
                path: sidecar.clone(),
                source,
            }
        })?;
        fs::write(&sidecar, json).map_err(|source| CheckpointError::Io {
            path: sidecar,
            source,
        })
    }

    /// Rebuild from a checkpoint written by `save_checkpoint`.
    pub fn load_checkpoint(path: &Path, device: &B::Device) -> Result<Self, CheckpointError> {
        let arch = read_architecture(path)?;
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        Self::new(&arch, device)
            .load_file(path, &recorder, device)
            .map_err(|e| CheckpointError::Record {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Human-readable layer table with output shapes and parameter counts.
    pub fn describe(&self) -> String {
        let arch = self.architecture();
        let spec = &arch.spec;
        let (m, nc) = (spec.max_detections, spec.num_classes);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "JerseyDetector ({}) input [3, {s}, {s}], {nc} classes, {m} detection slots",
            arch.head.as_str(),
            s = spec.input_size,
        );
        let _ = writeln!(out, "{:<34}{:<22}{:>12}", "layer", "output", "params");
        let _ = writeln!(out, "{}", "-".repeat(68));
        let mut row = |name: String, shape: String, params: usize| {
            let _ = writeln!(out, "{name:<34}{shape:<22}{params:>12}");
        };
        let mut side = spec.input_size;
        for (i, (width, params)) in spec
            .backbone
            .widths
            .iter()
            .zip(self.backbone.block_params())
            .enumerate()
        {
            side /= 2;
            row(
                format!("backbone.block{i} conv3x3+relu+pool"),
                format!("[{width}, {side}, {side}]"),
                params,
            );
        }
        let c = spec.backbone.out_channels();
        if let Some(head) = &self.custom_head {
            let [hidden, boxes, conf, cls] = head.layer_params();
            row("global_avg_pool".into(), format!("[{c}]"), 0);
            row(
                format!("dense+relu+dropout({})", spec.dropout),
                format!("[{}]", spec.hidden),
                hidden,
            );
            row("boxes (sigmoid)".into(), format!("[{m}, 4]"), boxes);
            row("confidence (sigmoid)".into(), format!("[{m}]"), conf);
            row("classes (softmax)".into(), format!("[{m}, {nc}]"), cls);
        }
        if let Some(head) = &self.grid_head {
            let g = head.grid();
            let [obj, boxes, cls] = head.layer_params();
            row("grid_avg_pool".into(), format!("[{c}, {g}, {g}]"), 0);
            row("objectness conv1x1 (sigmoid)".into(), format!("[{m}]"), obj);
            row("boxes conv1x1 (cell decode)".into(), format!("[{m}, 4]"), boxes);
            row("classes conv1x1 (softmax)".into(), format!("[{m}, {nc}]"), cls);
        }
        let _ = writeln!(out, "{}", "-".repeat(68));
        let _ = writeln!(out, "total parameters: {}", self.num_params());
        out
    }
}
