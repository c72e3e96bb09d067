//! Dataset validation, augmentation, and Burn-compatible batching for the
//! jersey-number detector.
//!
//! This crate provides utilities for:
//! - Validating a YAML dataset manifest and its on-disk layout
//! - Loading image/label pairs and summarizing class coverage
//! - Geometric, photometric and composite augmentation
//! - Burn-compatible batch iteration with per-sample seeded augmentation
//!   and an optional in-memory decode cache

pub mod aug;
pub mod cache;
pub mod samples;
pub mod types;
pub mod validation;

#[cfg(feature = "burn-runtime")]
pub mod batch;

pub use aug::{letterbox, AugmentationPolicy, SourceImage, TransformPipeline};
pub use cache::ImageCache;
pub use samples::{label_path_for, list_images, list_labels, load_rgb, load_split, read_annotations};
pub use types::*;
pub use validation::{summarize, validate, validate_sample, LABELS_DIR};

#[cfg(feature = "burn-runtime")]
pub use batch::{sample_seed, BatchConfig, BatchIter, BurnBatch};
