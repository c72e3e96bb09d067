#![recursion_limit = "256"]
//! Training for the jersey-number detector: configuration, the epoch loop,
//! checkpoints, run records and detection metrics.

pub mod checkpoint;
pub mod config;
pub mod eval;
pub mod orchestrator;
pub mod run;

pub use config::{ConfigError, ConfigOverrides, Device, ModelConfig, ModelConfigBuilder};
pub use eval::{evaluate, evaluate_detector, nms, EvalReport, EvalSettings, ImageEval};
pub use orchestrator::{run_validation, train, validation_samples, TrainingFailure};
pub use run::{EpochMetrics, FailureCause, RunStatus, TrainingRun};

use burn::backend::Autodiff;
use tracing::warn;

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn::backend::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn::backend::NdArray<f32>;

pub type ADBackend = Autodiff<TrainBackend>;

/// Reject a device the binary was not built for.
pub fn validate_backend_choice(device: Device) -> Result<(), ConfigError> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (device, built_wgpu) {
        (Device::Gpu, false) => Err(ConfigError::Invalid(
            "gpu requested but the backend-wgpu feature is not enabled; rebuild with --features backend-wgpu or use --device cpu".into(),
        )),
        (Device::Cpu, true) => {
            warn!("built with backend-wgpu; training will still use the WGPU backend despite --device cpu");
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Default device of the compiled training backend.
pub fn train_device() -> <TrainBackend as burn::tensor::backend::Backend>::Device {
    Default::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_is_always_available() {
        assert!(validate_backend_choice(Device::Cpu).is_ok());
    }

    #[cfg(not(feature = "backend-wgpu"))]
    #[test]
    fn gpu_requires_feature() {
        let err = validate_backend_choice(Device::Gpu).unwrap_err();
        assert!(err.to_string().contains("backend-wgpu"));
    }
}
