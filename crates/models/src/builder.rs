//! Model Builder: one contract, two construction strategies.
//!
//! Without a pretrained reference a fresh detector is assembled over a new
//! (or separately initialised) backbone; the head defaults to the custom
//! dense head. With one, a single-stage grid detector checkpoint is loaded
//! and its class head re-targeted.

use burn::tensor::backend::Backend;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::backbone::Backbone;
use crate::detector::{
    read_architecture, sidecar_path, ArchitectureSpec, CheckpointError, DetectorSpec, HeadKind,
    JerseyDetector,
};
use crate::loss::{DetectionLoss, LossWeights};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to load weights from {path}: {reason}")]
    BackboneLoad { path: PathBuf, reason: String },
    #[error("invalid detector spec: {0}")]
    InvalidSpec(String),
}

impl From<CheckpointError> for BuildError {
    fn from(err: CheckpointError) -> Self {
        let path = match &err {
            CheckpointError::Io { path, .. }
            | CheckpointError::Sidecar { path, .. }
            | CheckpointError::Record { path, .. } => path.clone(),
        };
        BuildError::BackboneLoad {
            path,
            reason: err.to_string(),
        }
    }
}

pub struct BuiltModel<B: Backend> {
    pub detector: JerseyDetector<B>,
    pub loss: DetectionLoss,
}

#[derive(Debug, Clone)]
pub struct ModelBuilder {
    pub spec: DetectorSpec,
    pub loss_weights: LossWeights,
    /// Backbone record to initialise the custom-head strategy from.
    pub backbone_weights: Option<PathBuf>,
    /// Head assembled when no pretrained reference is given.
    pub scratch_head: HeadKind,
}

impl ModelBuilder {
    pub fn new(spec: DetectorSpec) -> Self {
        Self {
            spec,
            loss_weights: LossWeights::default(),
            backbone_weights: None,
            scratch_head: HeadKind::CustomHead,
        }
    }

    pub fn with_loss_weights(mut self, weights: LossWeights) -> Self {
        self.loss_weights = weights;
        self
    }

    pub fn with_backbone_weights(mut self, path: Option<PathBuf>) -> Self {
        self.backbone_weights = path;
        self
    }

    pub fn with_scratch_head(mut self, head: HeadKind) -> Self {
        self.scratch_head = head;
        self
    }

    pub fn build<B: Backend>(
        &self,
        pretrained: Option<&Path>,
        device: &B::Device,
    ) -> Result<BuiltModel<B>, BuildError> {
        self.spec.validate().map_err(BuildError::InvalidSpec)?;
        let detector = match pretrained {
            Some(reference) => self.fine_tune(reference, device)?,
            None => self.from_scratch(device)?,
        };
        info!(
            head = detector.head_kind().as_str(),
            classes = self.spec.num_classes,
            max_detections = self.spec.max_detections,
            input_size = self.spec.input_size,
            "built detector"
        );
        Ok(BuiltModel {
            detector,
            loss: DetectionLoss::new(self.loss_weights),
        })
    }

    fn from_scratch<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<JerseyDetector<B>, BuildError> {
        let arch = ArchitectureSpec {
            head: self.scratch_head,
            spec: self.spec.clone(),
        };
        let detector = JerseyDetector::new(&arch, device);
        let Some(path) = &self.backbone_weights else {
            return Ok(detector);
        };
        info!(path = %path.display(), "initialising backbone from weights");
        let backbone: Backbone<B> = Backbone::new(&self.spec.backbone, device);
        let backbone = backbone
            .load_weights(path, device)
            .map_err(|e| BuildError::BackboneLoad {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(detector.with_backbone(backbone))
    }

    fn fine_tune<B: Backend>(
        &self,
        reference: &Path,
        device: &B::Device,
    ) -> Result<JerseyDetector<B>, BuildError> {
        info!(path = %reference.display(), "loading pretrained single-stage detector");
        let original = read_architecture(reference)?;
        if original.head != HeadKind::SingleStage {
            return Err(BuildError::BackboneLoad {
                path: sidecar_path(reference),
                reason: format!(
                    "expected a single_stage checkpoint, found {}",
                    original.head.as_str()
                ),
            });
        }
        if original.spec.max_detections != self.spec.max_detections {
            return Err(BuildError::BackboneLoad {
                path: sidecar_path(reference),
                reason: format!(
                    "checkpoint has {} detection slots, configured {}",
                    original.spec.max_detections, self.spec.max_detections
                ),
            });
        }
        if self.spec.input_size < original.spec.backbone.stride() {
            return Err(BuildError::BackboneLoad {
                path: sidecar_path(reference),
                reason: format!(
                    "input size {} is below the checkpoint backbone stride {}",
                    self.spec.input_size,
                    original.spec.backbone.stride()
                ),
            });
        }
        let loaded = JerseyDetector::<B>::load_checkpoint(reference, device)?;
        info!(
            from_classes = original.spec.num_classes,
            to_classes = self.spec.num_classes,
            "re-targeting class head"
        );
        let mut detector = loaded.retarget(self.spec.num_classes, device);
        detector.architecture.0.spec.input_size = self.spec.input_size;
        Ok(detector)
    }
}

/// Persist only the backbone of a detector, for `--backbone-weights`.
pub fn export_backbone<B: Backend>(
    detector: &JerseyDetector<B>,
    path: &Path,
) -> Result<(), BuildError> {
    detector
        .clone()
        .into_backbone()
        .save_weights(path)
        .map_err(|e| BuildError::BackboneLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
