//! Run record: per-epoch metrics, status and on-disk persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::ModelConfig;

pub const RUN_FILE: &str = "run.json";
pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based.
    pub epoch: usize,
    pub loss: f32,
    pub box_loss: f32,
    pub confidence_loss: f32,
    pub class_loss: f32,
    pub samples: usize,
    pub wall_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    #[error("numeric engine panicked at epoch {epoch}: {message}")]
    EnginePanic { epoch: usize, message: String },
    #[error("non-finite loss at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize },
    #[error("batch assembly failed at epoch {epoch}: {message}")]
    Batch { epoch: usize, message: String },
    #[error("checkpoint write failed: {0}")]
    Checkpoint(String),
    #[error("validation pass failed: {0}")]
    Validation(String),
    #[error("run record could not be written: {0}")]
    Record(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed(FailureCause),
}

/// Frozen result of a training run. Only the orchestrator constructs one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    config: ModelConfig,
    run_dir: PathBuf,
    checkpoint_dir: PathBuf,
    epochs: Vec<EpochMetrics>,
    map50: Option<f32>,
    map50_95: Option<f32>,
    precision: Option<f32>,
    recall: Option<f32>,
    status: RunStatus,
    last_checkpoint: Option<PathBuf>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl TrainingRun {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }
    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }
    pub fn map50(&self) -> Option<f32> {
        self.map50
    }
    pub fn map50_95(&self) -> Option<f32> {
        self.map50_95
    }
    pub fn precision(&self) -> Option<f32> {
        self.precision
    }
    pub fn recall(&self) -> Option<f32> {
        self.recall
    }
    pub fn status(&self) -> &RunStatus {
        &self.status
    }
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
    /// Checkpoint holding the final weights of the run.
    pub fn last_checkpoint(&self) -> Option<&Path> {
        self.last_checkpoint.as_deref()
    }
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn load(run_dir: &Path) -> Result<Self, FailureCause> {
        let path = run_dir.join(RUN_FILE);
        let raw = fs::read_to_string(&path)
            .map_err(|e| FailureCause::Record(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| FailureCause::Record(format!("{}: {e}", path.display())))
    }
}

/// Mutable in-progress run owned by the orchestrator.
pub(crate) struct RunRecorder {
    config: ModelConfig,
    run_dir: PathBuf,
    checkpoint_dir: PathBuf,
    epochs: Vec<EpochMetrics>,
    last_checkpoint: Option<PathBuf>,
    started_at: DateTime<Utc>,
}

impl RunRecorder {
    /// Create the run directory and truncate any previous metrics file.
    pub(crate) fn start(config: &ModelConfig, run_dir: &Path) -> Result<Self, FailureCause> {
        let checkpoint_dir = run_dir.join("checkpoints");
        fs::create_dir_all(&checkpoint_dir)
            .map_err(|e| FailureCause::Record(format!("{}: {e}", checkpoint_dir.display())))?;
        let metrics = run_dir.join(METRICS_FILE);
        fs::write(&metrics, b"")
            .map_err(|e| FailureCause::Record(format!("{}: {e}", metrics.display())))?;
        Ok(Self {
            config: config.clone(),
            run_dir: run_dir.to_path_buf(),
            checkpoint_dir,
            epochs: Vec::new(),
            last_checkpoint: None,
            started_at: Utc::now(),
        })
    }

    pub(crate) fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub(crate) fn set_last_checkpoint(&mut self, path: PathBuf) {
        self.last_checkpoint = Some(path);
    }

    pub(crate) fn last_checkpoint(&self) -> Option<&Path> {
        self.last_checkpoint.as_deref()
    }

    pub(crate) fn push_epoch(&mut self, metrics: EpochMetrics) -> Result<(), FailureCause> {
        let path = self.run_dir.join(METRICS_FILE);
        let line = serde_json::to_string(&metrics)
            .map_err(|e| FailureCause::Record(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| FailureCause::Record(format!("{}: {e}", path.display())))?;
        writeln!(file, "{line}")
            .map_err(|e| FailureCause::Record(format!("{}: {e}", path.display())))?;
        self.epochs.push(metrics);
        Ok(())
    }

    /// Freeze into an immutable run and persist it to `run.json`.
    pub(crate) fn finish(
        self,
        status: RunStatus,
        metrics: Option<(f32, f32, f32, f32)>,
    ) -> Result<TrainingRun, (TrainingRun, FailureCause)> {
        let (map50, map50_95, precision, recall) = match metrics {
            Some((a, b, p, r)) => (Some(a), Some(b), Some(p), Some(r)),
            None => (None, None, None, None),
        };
        let run = TrainingRun {
            config: self.config,
            run_dir: self.run_dir,
            checkpoint_dir: self.checkpoint_dir,
            epochs: self.epochs,
            map50,
            map50_95,
            precision,
            recall,
            status,
            last_checkpoint: self.last_checkpoint,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        match write_run(&run) {
            Ok(()) => Ok(run),
            Err(cause) => Err((run, cause)),
        }
    }
}

fn write_run(run: &TrainingRun) -> Result<(), FailureCause> {
    let path = run.run_dir.join(RUN_FILE);
    let json = serde_json::to_string_pretty(run).map_err(|e| FailureCause::Record(e.to_string()))?;
    fs::write(&path, json).map_err(|e| FailureCause::Record(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfigBuilder;

    fn metrics(epoch: usize) -> EpochMetrics {
        EpochMetrics {
            epoch,
            loss: 1.5,
            box_loss: 0.5,
            confidence_loss: 0.5,
            class_loss: 0.5,
            samples: 4,
            wall_secs: 0.1,
        }
    }

    #[test]
    fn recorder_persists_epochs_and_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ModelConfigBuilder::with_classes(vec!["1".into()])
            .build()
            .unwrap();
        let mut rec = RunRecorder::start(&cfg, dir.path()).unwrap();
        assert!(rec.checkpoint_dir().is_dir());
        rec.push_epoch(metrics(1)).unwrap();
        rec.push_epoch(metrics(2)).unwrap();
        let run = rec
            .finish(RunStatus::Completed, Some((0.5, 0.25, 0.4, 0.3)))
            .unwrap();

        let lines = fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap();
        assert_eq!(lines.lines().count(), 2);
        let reloaded = TrainingRun::load(dir.path()).unwrap();
        assert_eq!(reloaded, run);
        assert_eq!(reloaded.epochs()[1].epoch, 2);
        assert_eq!(reloaded.map50(), Some(0.5));
    }

    #[test]
    fn failed_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ModelConfigBuilder::with_classes(vec!["1".into()])
            .build()
            .unwrap();
        let rec = RunRecorder::start(&cfg, dir.path()).unwrap();
        let cause = FailureCause::NonFiniteLoss { epoch: 1, batch: 0 };
        let run = rec.finish(RunStatus::Failed(cause.clone()), None).unwrap();
        assert!(!run.is_completed());
        let reloaded = TrainingRun::load(dir.path()).unwrap();
        assert_eq!(reloaded.status(), &RunStatus::Failed(cause));
    }
}
