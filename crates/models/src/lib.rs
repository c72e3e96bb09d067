//! Burn detector models for jersey-number detection.
//!
//! This crate defines:
//! - `Backbone`: conv feature extractor shared by both heads.
//! - `CustomHead`: dense head over globally pooled features.
//! - `GridHead`: single-stage grid head, re-targetable to a new class set.
//! - `JerseyDetector`: backbone plus one head, with checkpoint helpers.
//! - `ModelBuilder`: picks the construction strategy and attaches the loss.
//! - `NamedTensor`: flat parameter tables used by the exporters.
//!
//! Both heads share one output contract (`DetectionOutput`), so training,
//! evaluation and export never branch on the head kind.

pub mod backbone;
pub mod builder;
pub mod custom_head;
pub mod detector;
pub mod loss;
pub mod params;
pub mod single_stage;

pub use backbone::{Backbone, BackboneConfig};
pub use builder::{export_backbone, BuildError, BuiltModel, ModelBuilder};
pub use detector::{
    read_architecture, sidecar_path, ArchitectureSpec, CheckpointError, Detection,
    DetectionOutput, DetectorSpec, HeadKind, JerseyDetector,
};
pub use loss::{build_greedy_targets, iou_xyxy, DetectionLoss, LossTerms, LossValues, LossWeights};
pub use params::{NamedTensor, ParamError};
