use burn::backend::NdArray;
use burn::tensor::Tensor;
use models::{
    export_backbone, BackboneConfig, BuildError, DetectorSpec, HeadKind, JerseyDetector,
    ModelBuilder,
};

type B = NdArray<f32>;

fn small_spec(num_classes: usize) -> DetectorSpec {
    DetectorSpec::new(64, num_classes, 10).with_backbone(BackboneConfig {
        widths: vec![4, 8],
    })
}

fn assert_contract(detector: &JerseyDetector<B>, nc: usize) {
    let device = Default::default();
    let out = detector.forward(Tensor::<B, 4>::ones([1, 3, 64, 64], &device));
    assert_eq!(out.boxes.dims(), [1, 10, 4]);
    assert_eq!(out.confidence.dims(), [1, 10]);
    assert_eq!(out.class_probs.dims(), [1, 10, nc]);

    let boxes = out.boxes.into_data().to_vec::<f32>().unwrap();
    for b in boxes.chunks(4) {
        assert!(b.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(b[0] <= b[2] && b[1] <= b[3]);
    }
    let probs = out.class_probs.into_data().to_vec::<f32>().unwrap();
    for slot in probs.chunks(nc) {
        assert!((slot.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }
}

#[test]
fn custom_head_outputs_follow_the_contract() -> anyhow::Result<()> {
    let built = ModelBuilder::new(small_spec(3)).build::<B>(None, &Default::default())?;
    assert_eq!(built.detector.head_kind(), HeadKind::CustomHead);
    assert_contract(&built.detector, 3);
    Ok(())
}

#[test]
fn fine_tuned_outputs_follow_the_contract() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let device = Default::default();
    // A pretrained single-stage checkpoint over a different class set.
    let pretrained = JerseyDetector::<B>::new(
        &models::ArchitectureSpec {
            head: HeadKind::SingleStage,
            spec: small_spec(80),
        },
        &device,
    );
    let reference = tmp.path().join("pretrained.bin");
    pretrained.save_checkpoint(&reference)?;

    let built = ModelBuilder::new(small_spec(3)).build::<B>(Some(&reference), &device)?;
    assert_eq!(built.detector.head_kind(), HeadKind::SingleStage);
    assert_eq!(built.detector.architecture().spec.num_classes, 3);
    assert_contract(&built.detector, 3);
    Ok(())
}

#[test]
fn missing_pretrained_checkpoint_is_a_load_error() {
    let result = ModelBuilder::new(small_spec(3))
        .build::<B>(Some(std::path::Path::new("/no/such/model.bin")), &Default::default());
    assert!(matches!(result, Err(BuildError::BackboneLoad { .. })));
}

#[test]
fn custom_head_checkpoint_cannot_be_fine_tuned() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let device = Default::default();
    let built = ModelBuilder::new(small_spec(3)).build::<B>(None, &device)?;
    let reference = tmp.path().join("custom.bin");
    built.detector.save_checkpoint(&reference)?;
    let result = ModelBuilder::new(small_spec(3)).build::<B>(Some(&reference), &device);
    assert!(matches!(result, Err(BuildError::BackboneLoad { .. })));
    Ok(())
}

#[test]
fn backbone_weights_round_trip_and_bad_files_fail() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let device = Default::default();
    let source = ModelBuilder::new(small_spec(3)).build::<B>(None, &device)?;
    let weights = tmp.path().join("backbone.bin");
    export_backbone(&source.detector, &weights)?;

    let built = ModelBuilder::new(small_spec(5))
        .with_backbone_weights(Some(weights))
        .build::<B>(None, &device)?;
    assert_contract(&built.detector, 5);

    let garbage = tmp.path().join("garbage.bin");
    std::fs::write(&garbage, b"not a record")?;
    let result = ModelBuilder::new(small_spec(3))
        .with_backbone_weights(Some(garbage))
        .build::<B>(None, &device);
    assert!(matches!(result, Err(BuildError::BackboneLoad { .. })));
    Ok(())
}

#[test]
fn invalid_spec_is_rejected_before_construction() {
    let result = ModelBuilder::new(DetectorSpec::new(64, 0, 10)).build::<B>(None, &Default::default());
    assert!(matches!(result, Err(BuildError::InvalidSpec(_))));
}

#[test]
fn describe_lists_heads_and_parameter_total() -> anyhow::Result<()> {
    let built = ModelBuilder::new(small_spec(3)).build::<B>(None, &Default::default())?;
    let text = built.detector.describe();
    assert!(text.contains("custom_head"));
    assert!(text.contains("classes (softmax)"));
    assert!(text.contains("[10, 3]"));
    assert!(text.contains("total parameters:"));
    Ok(())
}

#[test]
fn checkpoints_reload_with_identical_outputs() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let device = Default::default();
    let built = ModelBuilder::new(small_spec(3)).build::<B>(None, &device)?;
    let path = tmp.path().join("last.bin");
    built.detector.save_checkpoint(&path)?;
    let reloaded = JerseyDetector::<B>::load_checkpoint(&path, &device)?;
    let input = Tensor::<B, 4>::ones([1, 3, 64, 64], &device);
    let a = built.detector.forward(input.clone()).confidence.into_data().to_vec::<f32>().unwrap();
    let b = reloaded.forward(input).confidence.into_data().to_vec::<f32>().unwrap();
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn scratch_single_stage_checkpoint_seeds_fine_tuning() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let device = Default::default();
    let head: HeadKind = "single-stage".parse().map_err(anyhow::Error::msg)?;
    let scratch = ModelBuilder::new(small_spec(2))
        .with_scratch_head(head)
        .build::<B>(None, &device)?;
    assert_eq!(scratch.detector.head_kind(), HeadKind::SingleStage);
    assert_contract(&scratch.detector, 2);
    let reference = tmp.path().join("seed.bin");
    scratch.detector.save_checkpoint(&reference)?;

    let tuned = ModelBuilder::new(small_spec(4)).build::<B>(Some(&reference), &device)?;
    assert_eq!(tuned.detector.head_kind(), HeadKind::SingleStage);
    assert_contract(&tuned.detector, 4);

    assert_eq!("custom_head".parse::<HeadKind>(), Ok(HeadKind::CustomHead));
    assert!("two_stage".parse::<HeadKind>().is_err());
    Ok(())
}
