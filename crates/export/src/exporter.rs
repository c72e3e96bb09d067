//! Exporter: one artifact per requested format, each attempted on its own.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_dataset::ValidatedDataset;
use models::JerseyDetector;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::{error, info, warn};
use training::{run_validation, TrainingRun};

use crate::calibration::CalibrationStream;
use crate::error::ExportError;
use crate::interchange::write_safetensors;
use crate::quantized::{JdqHeader, OutputParams, QuantizedModel, RangeObserver};

pub const QUANTIZED_FILE: &str = "jersey_detector_int8.jdq";
pub const INTERCHANGE_FILE: &str = "jersey_detector.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Quantized,
    Interchange,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Quantized => "quantized",
            ExportFormat::Interchange => "interchange",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ExportFormat::Quantized => QUANTIZED_FILE,
            ExportFormat::Interchange => INTERCHANGE_FILE,
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quantized" | "int8" | "mobile" => Ok(ExportFormat::Quantized),
            "interchange" | "safetensors" => Ok(ExportFormat::Interchange),
            _ => Err(ExportFailure::Unsupported {
                format: s.trim().to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportFailure {
    #[error("unsupported export format `{format}`")]
    Unsupported { format: String },
    #[error("{format} export failed: {cause}")]
    Failed { format: String, cause: String },
}

impl ExportFailure {
    fn failed(format: ExportFormat, cause: impl fmt::Display) -> Self {
        ExportFailure::Failed {
            format: format.as_str().to_string(),
            cause: cause.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedArtifact {
    pub format: ExportFormat,
    pub path: PathBuf,
    pub byte_size: u64,
    pub calibration_samples: usize,
    /// mAP50 of the dequantized weights on the validation split.
    pub validation_map50: Option<f32>,
}

/// One entry per requested format, in request order.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub results: Vec<(String, Result<ExportedArtifact, ExportFailure>)>,
}

impl ExportReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ExportedArtifact> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExportFailure> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().err())
    }
}

pub struct Exporter {
    out_dir: PathBuf,
    validation: Option<ValidatedDataset>,
}

impl Exporter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            validation: None,
        }
    }

    /// Score the dequantized int8 weights on this dataset's validation split.
    pub fn with_validation(mut self, dataset: ValidatedDataset) -> Self {
        self.validation = Some(dataset);
        self
    }

    /// Export a completed run. The run and its checkpoints are only read.
    pub fn export<B: Backend>(
        &self,
        run: &TrainingRun,
        formats: &[String],
        calibration: &mut dyn CalibrationStream,
        device: &B::Device,
    ) -> ExportReport {
        let mut report = ExportReport::default();
        let mut detector: Option<Result<JerseyDetector<B>, ExportError>> = None;
        for requested in formats {
            let result = requested.parse::<ExportFormat>().and_then(|format| {
                let loaded = detector.get_or_insert_with(|| load_detector(run, device));
                match loaded {
                    Ok(det) => self.export_one(format, run, det, calibration, device),
                    Err(cause) => Err(ExportFailure::failed(format, cause)),
                }
            });
            match &result {
                Ok(artifact) => info!(
                    format = %artifact.format,
                    path = %artifact.path.display(),
                    bytes = artifact.byte_size,
                    calibration_samples = artifact.calibration_samples,
                    validation_map50 = ?artifact.validation_map50,
                    "exported artifact"
                ),
                Err(e) => error!(requested = %requested, "{e}"),
            }
            report.results.push((requested.clone(), result));
        }
        report
    }

    fn export_one<B: Backend>(
        &self,
        format: ExportFormat,
        run: &TrainingRun,
        detector: &JerseyDetector<B>,
        calibration: &mut dyn CalibrationStream,
        device: &B::Device,
    ) -> Result<ExportedArtifact, ExportFailure> {
        std::fs::create_dir_all(&self.out_dir).map_err(|e| ExportFailure::failed(format, e))?;
        let path = self.out_dir.join(format.file_name());
        match format {
            ExportFormat::Interchange => {
                let byte_size = write_safetensors(
                    &path,
                    &detector.named_tensors(),
                    detector.architecture(),
                    run.config().class_names(),
                )
                .map_err(|e| ExportFailure::failed(format, e))?;
                Ok(ExportedArtifact {
                    format,
                    path,
                    byte_size,
                    calibration_samples: 0,
                    validation_map50: None,
                })
            }
            ExportFormat::Quantized => {
                let (model, samples) = quantize(run, detector, calibration, device)
                    .map_err(|e| ExportFailure::failed(format, e))?;
                let byte_size = model
                    .write(&path)
                    .map_err(|source| {
                        ExportFailure::failed(
                            format,
                            ExportError::Io {
                                path: path.clone(),
                                source,
                            },
                        )
                    })?;
                let validation_map50 = self.validate_quantized(run, detector, &model, device);
                Ok(ExportedArtifact {
                    format,
                    path,
                    byte_size,
                    calibration_samples: samples,
                    validation_map50,
                })
            }
        }
    }

    fn validate_quantized<B: Backend>(
        &self,
        run: &TrainingRun,
        detector: &JerseyDetector<B>,
        model: &QuantizedModel,
        device: &B::Device,
    ) -> Option<f32> {
        let dataset = self.validation.as_ref()?;
        let restored = match detector.clone().with_named_tensors(&model.dequantized()) {
            Ok(det) => det,
            Err(e) => {
                warn!(%e, "could not reload dequantized weights");
                return None;
            }
        };
        match run_validation(&restored, dataset, run.config(), device) {
            Ok(report) => Some(report.map50),
            Err(e) => {
                warn!(%e, "validation of quantized weights failed");
                None
            }
        }
    }
}

fn load_detector<B: Backend>(
    run: &TrainingRun,
    device: &B::Device,
) -> Result<JerseyDetector<B>, ExportError> {
    if !run.is_completed() {
        return Err(ExportError::IncompleteRun);
    }
    let path = run.last_checkpoint().ok_or(ExportError::NoCheckpoint)?;
    Ok(JerseyDetector::<B>::load_checkpoint(path, device)?)
}

/// Calibrate activation ranges and quantize weights.
fn quantize<B: Backend>(
    run: &TrainingRun,
    detector: &JerseyDetector<B>,
    calibration: &mut dyn CalibrationStream,
    device: &B::Device,
) -> Result<(QuantizedModel, usize), ExportError> {
    calibration.reset();
    let mut input = RangeObserver::default();
    let mut boxes = RangeObserver::default();
    let mut confidence = RangeObserver::default();
    let mut class_probs = RangeObserver::default();
    let mut samples = 0usize;
    while let Some(next) = calibration.next_sample() {
        let sample = next?;
        let expected = 3 * sample.side * sample.side;
        if sample.pixels.len() != expected {
            return Err(ExportError::CalibrationShape {
                actual: sample.pixels.len(),
                expected,
            });
        }
        input.observe(&sample.pixels);
        let images = Tensor::<B, 1>::from_floats(sample.pixels.as_slice(), device).reshape([
            1,
            3,
            sample.side,
            sample.side,
        ]);
        let out = detector.forward(images);
        boxes.observe(&out.boxes.into_data().to_vec::<f32>().unwrap_or_default());
        confidence.observe(&out.confidence.into_data().to_vec::<f32>().unwrap_or_default());
        class_probs.observe(&out.class_probs.into_data().to_vec::<f32>().unwrap_or_default());
        samples += 1;
    }
    calibration.reset();
    if samples == 0 {
        return Err(ExportError::EmptyCalibration);
    }

    let header = JdqHeader {
        architecture: detector.architecture().clone(),
        class_names: run.config().class_names().to_vec(),
        input: input.params(),
        outputs: OutputParams {
            boxes: boxes.params(),
            confidence: confidence.params(),
            class_probs: class_probs.params(),
        },
        calibration_samples: samples,
        tensors: Vec::new(),
    };
    Ok((
        QuantizedModel::quantize(header, &detector.named_tensors()),
        samples,
    ))
}
