//! End-to-end training runs on tiny synthetic datasets.

use burn::backend::{Autodiff, NdArray};
use burn_dataset::validate;
use image::{Rgb, RgbImage};
use models::{BackboneConfig, ModelBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use training::{
    train, ConfigOverrides, FailureCause, ModelConfig, ModelConfigBuilder, RunStatus, TrainingRun,
};

type B = Autodiff<NdArray<f32>>;

fn create_dataset(root: &Path, train: usize, val: usize) -> anyhow::Result<PathBuf> {
    let train_dir = root.join("images/train");
    let val_dir = root.join("images/val");
    let labels_dir = root.join("labels");
    fs::create_dir_all(&train_dir)?;
    fs::create_dir_all(&val_dir)?;
    fs::create_dir_all(&labels_dir)?;
    for i in 0..train + val {
        let (dir, name) = if i < train {
            (&train_dir, format!("frame_{i:03}"))
        } else {
            (&val_dir, format!("val_{i:03}"))
        };
        let mut img = RgbImage::from_pixel(48, 48, Rgb([20, 40, 60]));
        for y in 18..30 {
            for x in 16..32 {
                img.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        img.save(dir.join(format!("{name}.png")))?;
        fs::write(
            labels_dir.join(format!("{name}.txt")),
            format!("{} 0.5 0.5 0.33 0.25\n", i % 3),
        )?;
    }
    let manifest = root.join("data.yaml");
    fs::write(
        &manifest,
        "train: images/train\nval: images/val\nnc: 3\nnames: ['7', '10', '23']\n",
    )?;
    Ok(manifest)
}

fn small_config(names: Vec<String>) -> anyhow::Result<ModelConfig> {
    Ok(ModelConfigBuilder::with_classes(names)
        .input_size(64)
        .batch_size(2)
        .epochs(2)
        .max_detections(4)
        .save_period(1)
        .backbone(BackboneConfig { widths: vec![4, 8] })
        .build()?)
}

#[test]
fn two_epoch_run_records_metrics_and_checkpoints() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = create_dataset(tmp.path(), 5, 2)?;
    let dataset = validate(&manifest)?;
    let config = small_config(dataset.manifest.class_names.clone())?;
    let device = Default::default();
    let built = ModelBuilder::new(config.detector_spec())
        .with_loss_weights(config.loss_weights())
        .build::<B>(None, &device)?;

    let run_dir = tmp.path().join("runs/jersey");
    let run = train(built, &dataset, &config, &run_dir, &device)?;

    assert!(run.is_completed());
    let epochs: Vec<usize> = run.epochs().iter().map(|m| m.epoch).collect();
    assert_eq!(epochs, vec![1, 2]);
    for m in run.epochs() {
        assert!(m.loss.is_finite());
        assert_eq!(m.samples, 5);
    }
    let map50 = run.map50().expect("map50");
    let map50_95 = run.map50_95().expect("map50_95");
    assert!((0.0..=1.0).contains(&map50));
    assert!((0.0..=1.0).contains(&map50_95));

    let ckpt = run_dir.join("checkpoints");
    for name in [
        "epoch_001.bin",
        "epoch_002.bin",
        "last.bin",
        "last.json",
        "backbone.bin",
    ] {
        assert!(ckpt.join(name).is_file(), "missing {name}");
    }
    assert_eq!(run.last_checkpoint(), Some(ckpt.join("last.bin").as_path()));
    let lines = fs::read_to_string(run_dir.join("metrics.jsonl"))?;
    assert_eq!(lines.lines().count(), 2);
    let reloaded = TrainingRun::load(&run_dir)?;
    assert!(reloaded.is_completed());
    assert_eq!(reloaded.epochs().len(), 2);
    assert_eq!(reloaded.config(), run.config());
    Ok(())
}

#[test]
fn empty_val_split_falls_back_to_training_images() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = create_dataset(tmp.path(), 3, 0)?;
    let dataset = validate(&manifest)?;
    let samples = training::validation_samples(&dataset)?;
    assert_eq!(samples.len(), 3);
    Ok(())
}

#[test]
fn undecodable_image_freezes_a_failed_run() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = create_dataset(tmp.path(), 3, 1)?;
    fs::write(tmp.path().join("images/train/broken.png"), b"not a png")?;
    let dataset = validate(&manifest)?;
    let config = small_config(dataset.manifest.class_names.clone())?;
    let device = Default::default();
    let built = ModelBuilder::new(config.detector_spec()).build::<B>(None, &device)?;

    let run_dir = tmp.path().join("run");
    let failure = train(built, &dataset, &config, &run_dir, &device).unwrap_err();
    assert!(matches!(failure.cause, FailureCause::Batch { epoch: 1, .. }));
    assert!(failure.last_checkpoint.is_none());
    let recorded = TrainingRun::load(&run_dir)?;
    assert!(matches!(recorded.status(), RunStatus::Failed(FailureCause::Batch { .. })));
    assert!(recorded.map50().is_none());
    Ok(())
}

#[test]
fn override_file_is_applied_and_validated() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("overrides.toml");
    fs::write(
        &path,
        "[training]\nepochs = 4\n\n[detection]\ninput_size = 96\n\n[augmentation]\nmosaic_prob = 0.0\n",
    )?;
    let cfg = ModelConfigBuilder::with_classes(vec!["7".into()])
        .overrides(ConfigOverrides::from_path(&path)?)
        .build()?;
    assert_eq!(cfg.epochs(), 4);
    assert_eq!(cfg.input_size(), 96);
    assert_eq!(cfg.augmentation().mosaic_prob, 0.0);

    fs::write(&path, "[detection]\ninput_size = 100\n")?;
    let rejected = ModelConfigBuilder::with_classes(vec!["7".into()])
        .overrides(ConfigOverrides::from_path(&path)?)
        .build();
    assert!(rejected.is_err());
    Ok(())
}

#[test]
fn diverging_run_keeps_the_last_periodic_checkpoint() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = create_dataset(tmp.path(), 3, 1)?;
    let dataset = validate(&manifest)?;
    // One batch per epoch: epoch 1 takes a single step and is checkpointed,
    // the oversized step only shows up as a non-finite loss in epoch 2.
    let config = ModelConfigBuilder::with_classes(dataset.manifest.class_names.clone())
        .input_size(64)
        .batch_size(4)
        .epochs(3)
        .max_detections(4)
        .save_period(1)
        .learning_rate(1e30)
        .backbone(BackboneConfig { widths: vec![4, 8] })
        .build()?;
    let device = Default::default();
    let built = ModelBuilder::new(config.detector_spec()).build::<B>(None, &device)?;

    let run_dir = tmp.path().join("run");
    let failure = train(built, &dataset, &config, &run_dir, &device).unwrap_err();
    assert!(matches!(
        failure.cause,
        FailureCause::NonFiniteLoss { epoch: 2, batch: 0 }
    ));
    let epoch_one = run_dir.join("checkpoints/epoch_001.bin");
    assert!(epoch_one.is_file());
    assert_eq!(failure.last_checkpoint.as_deref(), Some(epoch_one.as_path()));
    assert!(!run_dir.join("checkpoints/last.bin").exists());

    let recorded = TrainingRun::load(&run_dir)?;
    assert!(matches!(
        recorded.status(),
        RunStatus::Failed(FailureCause::NonFiniteLoss { epoch: 2, .. })
    ));
    assert_eq!(recorded.epochs().len(), 1);
    assert_eq!(recorded.last_checkpoint(), Some(epoch_one.as_path()));
    assert!(recorded.map50().is_none());
    Ok(())
}
