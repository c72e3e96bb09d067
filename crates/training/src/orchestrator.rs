//! Training Orchestrator: epochs, checkpoints, failure capture and the final
//! validation pass.

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn_dataset::{
    list_images, load_split, BatchConfig, BatchIter, BurnBatch, DatasetResult, ValidatedDataset,
};
use data_contracts::DetectionSample;
use models::{BuiltModel, DetectionLoss, JerseyDetector, LossValues};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::checkpoint::{
    backbone_checkpoint_path, epoch_checkpoint_path, is_checkpoint_epoch, last_checkpoint_path,
    write_backbone, write_checkpoint,
};
use crate::config::ModelConfig;
use crate::eval::{evaluate_detector, EvalReport, EvalSettings};
use crate::run::{EpochMetrics, FailureCause, RunRecorder, RunStatus, TrainingRun};

/// A run that stopped early. `run` is frozen with status `Failed`.
#[derive(Debug, Error)]
#[error("training failed: {cause}")]
pub struct TrainingFailure {
    pub cause: FailureCause,
    pub run: Option<Box<TrainingRun>>,
    pub last_checkpoint: Option<PathBuf>,
}

enum StepOutcome<M> {
    Updated(M, LossValues),
    NonFinite,
}

#[derive(Default)]
struct EpochAccumulator {
    total: f64,
    boxes: f64,
    confidence: f64,
    classes: f64,
    samples: usize,
}

impl EpochAccumulator {
    fn add(&mut self, values: LossValues, samples: usize) {
        let w = samples as f64;
        self.total += values.total as f64 * w;
        self.boxes += values.boxes as f64 * w;
        self.confidence += values.confidence as f64 * w;
        self.classes += values.classes as f64 * w;
        self.samples += samples;
    }

    fn finish(self, epoch: usize, wall_secs: f64) -> EpochMetrics {
        let n = self.samples.max(1) as f64;
        EpochMetrics {
            epoch,
            loss: (self.total / n) as f32,
            box_loss: (self.boxes / n) as f32,
            confidence_loss: (self.confidence / n) as f32,
            class_loss: (self.classes / n) as f32,
            samples: self.samples,
            wall_secs,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Validation images; the training images stand in when `val` has none.
pub fn validation_samples(dataset: &ValidatedDataset) -> DatasetResult<Vec<DetectionSample>> {
    let manifest = &dataset.manifest;
    let val_has_images =
        manifest.val_path.is_dir() && !list_images(&manifest.val_path)?.is_empty();
    if val_has_images {
        return load_split(&manifest.val_path, &dataset.labels_dir, manifest.num_classes);
    }
    warn!(
        val = %manifest.val_path.display(),
        "validation directory has no images; evaluating on training images"
    );
    load_split(&manifest.train_path, &dataset.labels_dir, manifest.num_classes)
}

fn fail(recorder: RunRecorder, cause: FailureCause) -> TrainingFailure {
    error!(%cause, "training failed");
    let last_checkpoint = recorder.last_checkpoint().map(Path::to_path_buf);
    let run = match recorder.finish(RunStatus::Failed(cause.clone()), None) {
        Ok(run) => run,
        Err((run, record_err)) => {
            error!(%record_err, "could not persist failed run");
            run
        }
    };
    TrainingFailure {
        cause,
        run: Some(Box::new(run)),
        last_checkpoint,
    }
}

/// Train `model` on `dataset` and write checkpoints and run records under
/// `run_dir`.
pub fn train<B: AutodiffBackend>(
    model: BuiltModel<B>,
    dataset: &ValidatedDataset,
    config: &ModelConfig,
    run_dir: &Path,
    device: &B::Device,
) -> Result<TrainingRun, TrainingFailure> {
    let mut recorder = RunRecorder::start(config, run_dir).map_err(|cause| TrainingFailure {
        cause,
        run: None,
        last_checkpoint: None,
    })?;

    let train_samples = match load_split(
        &dataset.manifest.train_path,
        &dataset.labels_dir,
        config.num_classes(),
    ) {
        Ok(samples) => samples,
        Err(e) => {
            return Err(fail(
                recorder,
                FailureCause::Batch {
                    epoch: 0,
                    message: e.to_string(),
                },
            ))
        }
    };
    info!(
        samples = train_samples.len(),
        epochs = config.epochs(),
        batch_size = config.batch_size(),
        lr = config.learning_rate(),
        cache_images = config.cache_images(),
        augmentation = %config.augmentation().describe(),
        "starting training"
    );

    let mut iter = BatchIter::new(
        train_samples,
        BatchConfig {
            image_size: config.input_size() as u32,
            max_boxes: config.max_detections(),
            shuffle: true,
            seed: config.seed(),
            policy: config.augmentation().clone(),
            cache_images: config.cache_images(),
        },
    );
    let BuiltModel {
        detector: mut model,
        loss,
    } = model;
    let mut optim = AdamConfig::new().init::<B, JerseyDetector<B>>();
    let lr = config.learning_rate();

    for epoch in 1..=config.epochs() {
        let started = Instant::now();
        iter.start_epoch(epoch);
        let mut acc = EpochAccumulator::default();
        let mut batch_idx = 0usize;
        loop {
            let batch = match iter.next_batch::<B>(config.batch_size(), device) {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    return Err(fail(
                        recorder,
                        FailureCause::Batch {
                            epoch,
                            message: e.to_string(),
                        },
                    ))
                }
            };
            let samples = batch.len();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                optimize_step(model, &loss, &mut optim, lr, batch)
            }));
            match outcome {
                Ok(StepOutcome::Updated(next, values)) => {
                    model = next;
                    acc.add(values, samples);
                }
                Ok(StepOutcome::NonFinite) => {
                    return Err(fail(
                        recorder,
                        FailureCause::NonFiniteLoss {
                            epoch,
                            batch: batch_idx,
                        },
                    ))
                }
                Err(payload) => {
                    return Err(fail(
                        recorder,
                        FailureCause::EnginePanic {
                            epoch,
                            message: panic_message(payload.as_ref()),
                        },
                    ))
                }
            }
            batch_idx += 1;
        }

        let metrics = acc.finish(epoch, started.elapsed().as_secs_f64());
        info!(
            epoch,
            of = config.epochs(),
            loss = metrics.loss,
            box_loss = metrics.box_loss,
            confidence_loss = metrics.confidence_loss,
            class_loss = metrics.class_loss,
            samples = metrics.samples,
            secs = metrics.wall_secs,
            "epoch complete"
        );
        if let Err(cause) = recorder.push_epoch(metrics) {
            return Err(fail(recorder, cause));
        }

        if is_checkpoint_epoch(epoch, config.save_period()) {
            let path = epoch_checkpoint_path(recorder.checkpoint_dir(), epoch);
            match write_checkpoint(&model, &path) {
                Ok(path) => recorder.set_last_checkpoint(path),
                Err(cause) => return Err(fail(recorder, cause)),
            }
        }
    }

    let last = last_checkpoint_path(recorder.checkpoint_dir());
    match write_checkpoint(&model, &last) {
        Ok(path) => recorder.set_last_checkpoint(path),
        Err(cause) => return Err(fail(recorder, cause)),
    }
    let backbone = backbone_checkpoint_path(recorder.checkpoint_dir());
    if let Err(cause) = write_backbone(&model, &backbone) {
        return Err(fail(recorder, cause));
    }

    let report = match run_validation(&model.valid(), dataset, config, device) {
        Ok(report) => report,
        Err(e) => return Err(fail(recorder, FailureCause::Validation(e.to_string()))),
    };
    info!(
        map50 = report.map50,
        map50_95 = report.map50_95,
        precision = report.precision,
        recall = report.recall,
        "training complete"
    );
    let metrics = (report.map50, report.map50_95, report.precision, report.recall);
    match recorder.finish(RunStatus::Completed, Some(metrics)) {
        Ok(run) => Ok(run),
        Err((run, cause)) => {
            let last_checkpoint = run.last_checkpoint().map(Path::to_path_buf);
            Err(TrainingFailure {
                cause,
                run: Some(Box::new(run)),
                last_checkpoint,
            })
        }
    }
}

fn optimize_step<B, O>(
    model: JerseyDetector<B>,
    loss: &DetectionLoss,
    optim: &mut O,
    lr: f64,
    batch: BurnBatch<B>,
) -> StepOutcome<JerseyDetector<B>>
where
    B: AutodiffBackend,
    O: Optimizer<JerseyDetector<B>, B>,
{
    let output = model.forward(batch.images);
    let terms = loss.forward(&output, batch.boxes, batch.box_mask, batch.classes);
    let values = terms.values();
    if !values.total.is_finite() {
        return StepOutcome::NonFinite;
    }
    let grads = GradientsParams::from_grads(terms.total.backward(), &model);
    StepOutcome::Updated(optim.step(lr, model, grads), values)
}

/// Evaluate a detector on the held-out split.
pub fn run_validation<B: burn::tensor::backend::Backend>(
    detector: &JerseyDetector<B>,
    dataset: &ValidatedDataset,
    config: &ModelConfig,
    device: &B::Device,
) -> DatasetResult<EvalReport> {
    let samples = validation_samples(dataset)?;
    evaluate_detector(
        detector,
        samples,
        EvalSettings {
            image_size: config.input_size() as u32,
            batch_size: config.batch_size(),
            num_classes: config.num_classes(),
            confidence_threshold: config.confidence_threshold(),
            nms_threshold: config.nms_threshold(),
        },
        device,
    )
}
