//! Shared data contracts for dataset manifests and box annotations.

pub mod labels;
pub mod manifest;

pub use labels::{BoundingBoxAnnotation, DetectionSample, LabelError, ValidationError};
pub use manifest::{DatasetManifest, ManifestError, ManifestFile};
