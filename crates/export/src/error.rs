use burn_dataset::DatasetError;
use models::CheckpointError;
use safetensors::SafeTensorError;
use std::path::PathBuf;
use thiserror::Error;

/// Why a single format could not be produced.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("training run did not complete")]
    IncompleteRun,
    #[error("training run has no checkpoint")]
    NoCheckpoint,
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("calibration sample: {0}")]
    Calibration(#[from] DatasetError),
    #[error("calibration sample has {actual} values, expected {expected}")]
    CalibrationShape { actual: usize, expected: usize },
    #[error("calibration stream is empty")]
    EmptyCalibration,
    #[error("tensor {name}: {source}")]
    Tensor {
        name: String,
        #[source]
        source: SafeTensorError,
    },
    #[error("safetensors serialization failed: {0}")]
    Serialize(#[source] SafeTensorError),
    #[error("metadata encoding failed: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
