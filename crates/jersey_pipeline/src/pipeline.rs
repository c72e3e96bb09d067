//! Stage sequencing: validate, build, train, export. Each stage gates the next.

use anyhow::{bail, Context};
use burn_dataset::{summarize, validate};
use export::{DatasetCalibrationStream, ExportedArtifact, Exporter};
use models::ModelBuilder;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info, warn};
use training::{
    train, train_device, ADBackend, ConfigOverrides, ModelConfigBuilder, TrainBackend, TrainingRun,
};

use crate::capability::{capability_check, compiled_backend};
use crate::cli::TrainJerseyArgs;

pub const ARCHITECTURE_FILE: &str = "model_architecture.txt";

#[derive(Debug)]
pub struct PipelineOutcome {
    pub run_dir: PathBuf,
    pub run: TrainingRun,
    pub artifacts: Vec<ExportedArtifact>,
}

pub fn run_pipeline(args: &TrainJerseyArgs) -> anyhow::Result<PipelineOutcome> {
    capability_check(args).context("startup capability check failed")?;
    info!(
        backend = compiled_backend(),
        device = %args.device,
        "starting jersey detector pipeline"
    );

    let dataset = validate(&args.data)
        .with_context(|| format!("dataset validation failed for {}", args.data.display()))?;
    let summary = summarize(&dataset).context("failed to summarize dataset labels")?;
    if summary.labelled == 0 {
        warn!("no image in the training split has labels");
    }

    let mut builder = ModelConfigBuilder::new(&dataset.manifest)
        .input_size(args.img)
        .batch_size(args.batch)
        .epochs(args.epochs)
        .device(args.device)
        .seed(args.seed)
        .max_detections(args.max_detections);
    if let Some(path) = &args.config {
        builder = builder.overrides(ConfigOverrides::from_path(path)?);
    }
    let config = builder.build().context("invalid training configuration")?;

    let run_dir = args.run_dir();
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;

    let device = train_device();
    let built = ModelBuilder::new(config.detector_spec())
        .with_loss_weights(config.loss_weights())
        .with_backbone_weights(args.backbone_weights.clone())
        .with_scratch_head(args.head)
        .build::<ADBackend>(args.pretrained.as_deref(), &device)
        .context("model build failed")?;
    let diagram = built.detector.describe();
    let diagram_path = run_dir.join(ARCHITECTURE_FILE);
    fs::write(&diagram_path, &diagram)
        .with_context(|| format!("failed to write {}", diagram_path.display()))?;
    info!(path = %diagram_path.display(), "wrote architecture diagram");

    let run = match train(built, &dataset, &config, &run_dir, &device) {
        Ok(run) => run,
        Err(failure) => {
            if let Some(ckpt) = &failure.last_checkpoint {
                warn!(checkpoint = %ckpt.display(), "last good checkpoint kept");
            }
            return Err(failure).context("training failed");
        }
    };

    let mut calibration = DatasetCalibrationStream::new(
        &dataset,
        config.input_size() as u32,
        args.calibration_samples,
    )
    .context("failed to prepare calibration samples")?;
    let report = Exporter::new(&run_dir)
        .with_validation(dataset.clone())
        .export::<TrainBackend>(&run, &args.formats, &mut calibration, &device);

    let artifacts: Vec<ExportedArtifact> = report.artifacts().cloned().collect();
    let failures: Vec<String> = report.failures().map(ToString::to_string).collect();
    for artifact in &artifacts {
        info!(
            format = %artifact.format,
            path = %artifact.path.display(),
            bytes = artifact.byte_size,
            "artifact ready"
        );
    }
    if !failures.is_empty() {
        for failure in &failures {
            error!("{failure}");
        }
        bail!(
            "{} of {} export formats failed: {}",
            failures.len(),
            args.formats.len(),
            failures.join("; ")
        );
    }

    let wall = run.finished_at() - run.started_at();
    info!(
        run_dir = %run_dir.display(),
        map50 = ?run.map50(),
        map50_95 = ?run.map50_95(),
        precision = ?run.precision(),
        recall = ?run.recall(),
        train_secs = wall.num_milliseconds() as f64 / 1000.0,
        "pipeline complete"
    );
    Ok(PipelineOutcome {
        run_dir,
        run,
        artifacts,
    })
}
