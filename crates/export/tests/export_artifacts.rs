//! Export of a tiny trained run into every supported format.

use burn::backend::{Autodiff, NdArray};
use burn_dataset::{validate, DatasetResult, ValidatedDataset};
use export::{
    CalibrationSample, CalibrationStream, DatasetCalibrationStream, ExportFailure, ExportFormat,
    Exporter, QuantizedModel,
};
use image::{Rgb, RgbImage};
use models::{BackboneConfig, JerseyDetector, ModelBuilder};
use std::fs;
use std::path::Path;
use training::{train, ModelConfigBuilder, TrainingRun};

type B = NdArray<f32>;
type AD = Autodiff<NdArray<f32>>;

fn trained_run(root: &Path) -> anyhow::Result<(ValidatedDataset, TrainingRun)> {
    let train_dir = root.join("images/train");
    let val_dir = root.join("images/val");
    let labels = root.join("labels");
    for dir in [&train_dir, &val_dir, &labels] {
        fs::create_dir_all(dir)?;
    }
    for i in 0..6 {
        let (dir, name) = if i < 4 {
            (&train_dir, format!("t{i}"))
        } else {
            (&val_dir, format!("v{i}"))
        };
        let shade = 40 + 30 * i as u8;
        RgbImage::from_pixel(40, 32, Rgb([shade, 90, 200 - shade]))
            .save(dir.join(format!("{name}.jpg")))?;
        fs::write(
            labels.join(format!("{name}.txt")),
            format!("{} 0.4 0.5 0.3 0.4\n", i % 2),
        )?;
    }
    let manifest = root.join("data.yaml");
    fs::write(
        &manifest,
        "train: images/train\nval: images/val\nnc: 2\nnames: ['4', '9']\n",
    )?;

    let dataset = validate(&manifest)?;
    let config = ModelConfigBuilder::new(&dataset.manifest)
        .input_size(32)
        .batch_size(2)
        .epochs(1)
        .max_detections(4)
        .backbone(BackboneConfig { widths: vec![4, 8] })
        .build()?;
    let device = Default::default();
    let built = ModelBuilder::new(config.detector_spec()).build::<AD>(None, &device)?;
    let run = train(built, &dataset, &config, &root.join("run"), &device)?;
    Ok((dataset, run))
}

struct EmptyStream;

impl CalibrationStream for EmptyStream {
    fn next_sample(&mut self) -> Option<DatasetResult<CalibrationSample>> {
        None
    }
    fn reset(&mut self) {}
    fn len(&self) -> usize {
        0
    }
}

#[test]
fn every_requested_format_gets_a_result_in_order() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let (dataset, run) = trained_run(tmp.path())?;
    let checkpoint = run.last_checkpoint().expect("checkpoint").to_path_buf();
    let before = fs::read(&checkpoint)?;

    let mut stream = DatasetCalibrationStream::new(&dataset, 32, 3)?;
    assert_eq!(stream.len(), 3);
    let exporter = Exporter::new(run.run_dir()).with_validation(dataset.clone());
    let formats: Vec<String> = ["int8", "onnx", "safetensors"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let report = exporter.export::<B>(&run, &formats, &mut stream, &Default::default());

    assert_eq!(report.results.len(), 3);
    assert!(!report.all_succeeded());
    assert_eq!(report.results[1].0, "onnx");
    assert_eq!(
        report.results[1].1,
        Err(ExportFailure::Unsupported {
            format: "onnx".into()
        })
    );

    let quantized = report.results[0].1.as_ref().expect("quantized export");
    assert_eq!(quantized.format, ExportFormat::Quantized);
    assert_eq!(quantized.calibration_samples, 3);
    assert_eq!(quantized.byte_size, fs::metadata(&quantized.path)?.len());
    let map50 = quantized.validation_map50.expect("validation map");
    assert!((0.0..=1.0).contains(&map50));

    let interchange = report.results[2].1.as_ref().expect("interchange export");
    assert_eq!(interchange.byte_size, fs::metadata(&interchange.path)?.len());

    // The run's checkpoint is never rewritten.
    assert_eq!(fs::read(&checkpoint)?, before);

    let detector = JerseyDetector::<B>::load_checkpoint(&checkpoint, &Default::default())?;
    let originals = detector.named_tensors();

    let jdq = QuantizedModel::read(&quantized.path)?;
    assert_eq!(jdq.header.class_names, vec!["4", "9"]);
    assert_eq!(jdq.header.calibration_samples, 3);
    for (entry, (orig, restored)) in jdq
        .header
        .tensors
        .iter()
        .zip(originals.iter().zip(jdq.dequantized()))
    {
        assert_eq!(entry.name, orig.name);
        for (a, b) in orig.values.iter().zip(&restored.values) {
            assert!((a - b).abs() <= entry.scale / 2.0 + 1e-6);
        }
    }

    let bytes = fs::read(&interchange.path)?;
    let st = safetensors::SafeTensors::deserialize(&bytes)?;
    assert_eq!(st.names().len(), originals.len());
    let first = st.tensor(&originals[0].name)?;
    assert_eq!(first.shape(), originals[0].shape.as_slice());
    let (_, meta) = safetensors::SafeTensors::read_metadata(&bytes)?;
    let meta = meta.metadata().clone().expect("metadata");
    assert_eq!(meta["class_names"], "[\"4\",\"9\"]");
    Ok(())
}

#[test]
fn empty_calibration_fails_only_the_quantized_format() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let (_, run) = trained_run(tmp.path())?;
    let exporter = Exporter::new(tmp.path().join("export"));
    let formats = vec!["mobile".to_string(), "interchange".to_string()];
    let report = exporter.export::<B>(&run, &formats, &mut EmptyStream, &Default::default());

    assert!(matches!(
        &report.results[0].1,
        Err(ExportFailure::Failed { format, cause })
            if format == "quantized" && cause.contains("empty")
    ));
    assert!(report.results[1].1.is_ok());
    assert!(!tmp.path().join("export/jersey_detector_int8.jdq").exists());
    Ok(())
}

#[test]
fn format_aliases_parse() {
    for alias in ["quantized", "INT8", "mobile"] {
        assert_eq!(alias.parse::<ExportFormat>().unwrap(), ExportFormat::Quantized);
    }
    for alias in ["interchange", "safetensors"] {
        assert_eq!(alias.parse::<ExportFormat>().unwrap(), ExportFormat::Interchange);
    }
    assert!("tflite".parse::<ExportFormat>().is_err());
}
