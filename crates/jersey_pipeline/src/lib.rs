//! `train_jersey` pipeline: Dataset Validator, Model Builder, Training
//! Orchestrator and Exporter run in sequence, each gating the next.

pub mod capability;
pub mod cli;
pub mod logging;
pub mod pipeline;

pub use capability::{capability_check, CapabilityError};
pub use cli::TrainJerseyArgs;
pub use logging::init_logging;
pub use pipeline::{run_pipeline, PipelineOutcome, ARCHITECTURE_FILE};
