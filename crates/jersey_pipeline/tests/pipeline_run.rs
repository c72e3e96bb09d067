//! Full `train_jersey` runs over a tiny synthetic dataset.

use clap::Parser;
use image::{Rgb, RgbImage};
use jersey_pipeline::{run_pipeline, TrainJerseyArgs, ARCHITECTURE_FILE};
use std::fs;
use std::path::Path;

fn create_dataset(root: &Path) -> anyhow::Result<()> {
    let labels = root.join("labels");
    fs::create_dir_all(root.join("images/train"))?;
    fs::create_dir_all(root.join("images/val"))?;
    fs::create_dir_all(&labels)?;
    for i in 0..5 {
        let split = if i < 4 { "train" } else { "val" };
        let mut img = RgbImage::from_pixel(36, 36, Rgb([10, 80, 30]));
        for y in 8..20 {
            for x in 10..22 {
                img.put_pixel(x, y, Rgb([250, 250, 250]));
            }
        }
        img.save(root.join(format!("images/{split}/shot_{i}.png")))?;
        fs::write(
            labels.join(format!("shot_{i}.txt")),
            format!("{} 0.44 0.39 0.33 0.33\n", i % 2),
        )?;
    }
    fs::write(
        root.join("data.yaml"),
        "train: images/train\nval: images/val\nnc: 2\nnames: ['11', '99']\n",
    )?;
    fs::write(
        root.join("overrides.toml"),
        "[training]\nsave_period = 1\n\n[backbone]\nwidths = [4, 8]\n",
    )?;
    Ok(())
}

fn args(root: &Path, formats: &str) -> TrainJerseyArgs {
    run_args(root, "smoke", formats, &[])
}

fn run_args(root: &Path, name: &str, formats: &str, extra: &[&str]) -> TrainJerseyArgs {
    let data = root.join("data.yaml");
    let config = root.join("overrides.toml");
    let project = root.join("runs");
    let mut argv = vec![
        "train_jersey",
        "--data",
        data.to_str().unwrap(),
        "--config",
        config.to_str().unwrap(),
        "--project",
        project.to_str().unwrap(),
        "--name",
        name,
        "--img",
        "32",
        "--batch",
        "2",
        "--epochs",
        "2",
        "--max-detections",
        "4",
        "--calibration-samples",
        "2",
        "--formats",
        formats,
    ];
    argv.extend_from_slice(extra);
    TrainJerseyArgs::try_parse_from(argv).unwrap()
}

#[test]
fn full_run_writes_every_documented_output() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_dataset(tmp.path())?;
    let outcome = run_pipeline(&args(tmp.path(), "quantized,interchange"))?;

    let run_dir = tmp.path().join("runs/smoke");
    assert_eq!(outcome.run_dir, run_dir);
    for file in [
        "jersey_detector_int8.jdq",
        "jersey_detector.safetensors",
        ARCHITECTURE_FILE,
        "run.json",
        "metrics.jsonl",
        "checkpoints/epoch_001.bin",
        "checkpoints/epoch_002.bin",
        "checkpoints/last.bin",
        "checkpoints/last.json",
        "checkpoints/backbone.bin",
    ] {
        assert!(run_dir.join(file).is_file(), "missing {file}");
    }
    assert_eq!(outcome.artifacts.len(), 2);
    assert_eq!(outcome.artifacts[0].calibration_samples, 2);
    assert_eq!(outcome.run.epochs().len(), 2);
    for metric in [outcome.run.precision(), outcome.run.recall()] {
        let value = metric.expect("validation metric");
        assert!((0.0..=1.0).contains(&value));
    }
    assert!(outcome.run.finished_at() >= outcome.run.started_at());

    let diagram = fs::read_to_string(run_dir.join(ARCHITECTURE_FILE))?;
    assert!(diagram.contains("custom_head"));
    assert!(diagram.contains("total parameters"));
    Ok(())
}

#[test]
fn unsupported_format_fails_the_run_after_exporting_the_rest() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_dataset(tmp.path())?;
    let err = run_pipeline(&args(tmp.path(), "tflite,interchange")).unwrap_err();
    assert!(err.to_string().contains("export formats failed"));
    assert!(tmp
        .path()
        .join("runs/smoke/jersey_detector.safetensors")
        .is_file());
    Ok(())
}

#[test]
fn invalid_manifest_stops_before_training() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_dataset(tmp.path())?;
    fs::write(
        tmp.path().join("data.yaml"),
        "train: images/train\nval: images/val\nnc: 3\nnames: ['11', '99']\n",
    )?;
    let err = run_pipeline(&args(tmp.path(), "quantized")).unwrap_err();
    assert!(format!("{err:#}").contains("dataset validation failed"));
    assert!(!tmp.path().join("runs/smoke/run.json").exists());
    Ok(())
}

#[test]
fn single_stage_run_seeds_pretrained_and_backbone_runs() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    create_dataset(tmp.path())?;
    let seed = run_pipeline(&run_args(
        tmp.path(),
        "seed",
        "interchange",
        &["--head", "single_stage"],
    ))?;
    let seed_ckpt = seed.run_dir.join("checkpoints");
    let seed_diagram = fs::read_to_string(seed.run_dir.join(ARCHITECTURE_FILE))?;
    assert!(seed_diagram.contains("single_stage"));
    assert!(seed_ckpt.join("backbone.bin").is_file());

    let pretrained = seed_ckpt.join("last.bin");
    let tuned = run_pipeline(&run_args(
        tmp.path(),
        "tuned",
        "interchange",
        &["--pretrained", pretrained.to_str().unwrap()],
    ))?;
    assert!(tuned.run.is_completed());
    let tuned_diagram = fs::read_to_string(tuned.run_dir.join(ARCHITECTURE_FILE))?;
    assert!(tuned_diagram.contains("single_stage"));
    assert!(tuned.run_dir.join("jersey_detector.safetensors").is_file());

    let backbone = seed_ckpt.join("backbone.bin");
    let warm = run_pipeline(&run_args(
        tmp.path(),
        "warm",
        "interchange",
        &["--backbone-weights", backbone.to_str().unwrap()],
    ))?;
    assert!(warm.run.is_completed());
    let warm_diagram = fs::read_to_string(warm.run_dir.join(ARCHITECTURE_FILE))?;
    assert!(warm_diagram.contains("custom_head"));
    Ok(())
}
