//! Core types, error definitions, and data structures for burn_dataset.

use data_contracts::{DatasetManifest, LabelError, ManifestError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("manifest not found: {path}")]
    MissingFile { path: PathBuf },
    #[error("manifest schema error in {path}: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },
    #[error("directory not found: {path}")]
    MissingDirectory { path: PathBuf },
    #[error("no training images found under {path}")]
    EmptyDataset { path: PathBuf },
    #[error("{image}: class id {class_id} outside [0, {num_classes})")]
    InvalidClass {
        image: PathBuf,
        class_id: u32,
        num_classes: usize,
    },
    #[error("{image}: bbox out of image bounds: {bbox:?}")]
    OutOfBounds { image: PathBuf, bbox: [f32; 4] },
    #[error("{image}: bbox non-finite or empty: {bbox:?}")]
    Degenerate { image: PathBuf, bbox: [f32; 4] },
    #[error("label parse error at {path}:{line}: {source}")]
    Label {
        path: PathBuf,
        line: usize,
        #[source]
        source: LabelError,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Result of a successful manifest validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedDataset {
    pub manifest: DatasetManifest,
    pub labels_dir: PathBuf,
    pub image_count: usize,
    pub label_count: usize,
}

/// Image after augmentation, ready for collation.
#[derive(Debug, Clone)]
pub struct DatasetSample {
    /// Image in CHW layout, normalized to [0, 1].
    pub image_chw: Vec<f32>,
    pub width: u32,
    pub height: u32,
    /// Normalized bounding boxes: [x_min, y_min, x_max, y_max] in 0..1.
    pub boxes: Vec<[f32; 4]>,
    /// Class id per box, co-indexed with `boxes`.
    pub classes: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub images: usize,
    pub labelled: usize,
    pub background: usize,
    pub boxes: usize,
    pub malformed_lines: usize,
    pub per_class: Vec<usize>,
    /// Names of classes with no box in the training split.
    pub unseen_classes: Vec<String>,
}
