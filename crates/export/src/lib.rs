//! Exporters for trained jersey-number detectors.
//!
//! - `quantized` (`int8`, `mobile`): int8 weights plus uint8 input/output
//!   parameters calibrated on real training images, written as `.jdq`.
//! - `interchange` (`safetensors`): f32 weights with architecture metadata.

pub mod calibration;
pub mod error;
pub mod exporter;
pub mod interchange;
pub mod quantized;

pub use calibration::{
    CalibrationSample, CalibrationStream, DatasetCalibrationStream, DEFAULT_CALIBRATION_SAMPLES,
};
pub use error::ExportError;
pub use exporter::{
    ExportFailure, ExportFormat, ExportReport, ExportedArtifact, Exporter, INTERCHANGE_FILE,
    QUANTIZED_FILE,
};
pub use quantized::{AffineParams, JdqHeader, QuantizedModel};
