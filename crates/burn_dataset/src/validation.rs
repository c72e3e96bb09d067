//! Dataset validation: manifest schema, on-disk layout, and per-sample checks.
//!
//! Everything here is read-only; running `validate` twice on an unchanged
//! dataset yields the same result and the same counts.

use crate::samples::{label_path_for, list_images, list_labels};
use crate::types::{DatasetError, DatasetResult, DatasetSummary, ValidatedDataset};
use data_contracts::{BoundingBoxAnnotation, DetectionSample, ManifestFile, ValidationError};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Name of the label directory expected next to the manifest.
pub const LABELS_DIR: &str = "labels";

pub fn validate(manifest_path: &Path) -> DatasetResult<ValidatedDataset> {
    info!(manifest = %manifest_path.display(), "validating dataset");
    if !manifest_path.is_file() {
        return Err(DatasetError::MissingFile {
            path: manifest_path.to_path_buf(),
        });
    }
    let raw = fs::read_to_string(manifest_path).map_err(|e| DatasetError::Io {
        path: manifest_path.to_path_buf(),
        source: e,
    })?;
    let base_dir = manifest_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let manifest = ManifestFile::from_yaml_str(&raw)
        .and_then(|file| file.into_manifest(base_dir))
        .map_err(|source| DatasetError::Schema {
            path: manifest_path.to_path_buf(),
            source,
        })?;

    let labels_dir = base_dir.join(LABELS_DIR);
    for dir in [&manifest.train_path, &labels_dir] {
        if !dir.is_dir() {
            return Err(DatasetError::MissingDirectory { path: dir.clone() });
        }
    }

    let image_count = list_images(&manifest.train_path)?.len();
    let label_count = list_labels(&labels_dir)?.len();
    info!(image_count, label_count, "found training images and label files");
    if image_count == 0 {
        return Err(DatasetError::EmptyDataset {
            path: manifest.train_path.clone(),
        });
    }
    if image_count != label_count {
        warn!(
            image_count,
            label_count, "image and label counts differ; unlabelled images train as background"
        );
    }

    Ok(ValidatedDataset {
        manifest,
        labels_dir,
        image_count,
        label_count,
    })
}

pub fn validate_sample(sample: &DetectionSample, num_classes: usize) -> DatasetResult<()> {
    let image = || sample.image.clone();
    sample.validate(num_classes).map_err(|err| match err {
        ValidationError::InvalidClass {
            class_id,
            num_classes,
        } => DatasetError::InvalidClass {
            image: image(),
            class_id,
            num_classes,
        },
        ValidationError::OutOfBounds(bbox) => DatasetError::OutOfBounds {
            image: image(),
            bbox,
        },
        ValidationError::Degenerate(bbox) => DatasetError::Degenerate {
            image: image(),
            bbox,
        },
    })
}

/// Walk every training image and its label file, counting boxes per class.
/// Malformed label lines are counted here rather than failing.
pub fn summarize(dataset: &ValidatedDataset) -> DatasetResult<DatasetSummary> {
    let num_classes = dataset.manifest.num_classes;
    let mut summary = DatasetSummary {
        per_class: vec![0; num_classes],
        ..Default::default()
    };
    for image in list_images(&dataset.manifest.train_path)? {
        summary.images += 1;
        let label_path = label_path_for(&image, &dataset.labels_dir);
        let raw = match fs::read_to_string(&label_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(DatasetError::Io {
                    path: label_path,
                    source: e,
                })
            }
        };
        let mut boxes_here = 0usize;
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match BoundingBoxAnnotation::from_yolo_line(line) {
                Ok(ann) => match summary.per_class.get_mut(ann.class_id as usize) {
                    Some(count) => {
                        *count += 1;
                        boxes_here += 1;
                    }
                    None => summary.malformed_lines += 1,
                },
                Err(_) => summary.malformed_lines += 1,
            }
        }
        summary.boxes += boxes_here;
        if boxes_here == 0 {
            summary.background += 1;
        } else {
            summary.labelled += 1;
        }
    }
    for (class_id, &count) in summary.per_class.iter().enumerate() {
        let name = dataset.manifest.class_name(class_id as u32).unwrap_or("?");
        debug!(class = name, boxes = count, "class count");
        if count == 0 {
            summary.unseen_classes.push(name.to_string());
        }
    }
    info!(
        images = summary.images,
        labelled = summary.labelled,
        background = summary.background,
        boxes = summary.boxes,
        "dataset summary"
    );
    if !summary.unseen_classes.is_empty() {
        warn!(classes = ?summary.unseen_classes, "classes without training boxes");
    }
    if summary.malformed_lines > 0 {
        warn!(malformed = summary.malformed_lines, "malformed label lines");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample(class_id: u32, bbox: [f32; 4]) -> DetectionSample {
        DetectionSample {
            image: PathBuf::from("img.png"),
            annotations: vec![BoundingBoxAnnotation { class_id, bbox }],
        }
    }

    #[test]
    fn sample_class_outside_range_is_rejected() {
        let err = validate_sample(&sample(3, [0.1, 0.1, 0.2, 0.2]), 3).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::InvalidClass {
                class_id: 3,
                num_classes: 3,
                ..
            }
        ));
        assert!(validate_sample(&sample(2, [0.1, 0.1, 0.2, 0.2]), 3).is_ok());
    }

    #[test]
    fn bad_boxes_get_their_own_errors() {
        let err = validate_sample(&sample(0, [0.2, 0.2, 1.4, 0.6]), 3).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::OutOfBounds { bbox, .. } if bbox[2] == 1.4
        ));
        let err = validate_sample(&sample(0, [0.5, 0.2, 0.5, 0.6]), 3).unwrap_err();
        assert!(matches!(err, DatasetError::Degenerate { .. }));
        assert!(err.to_string().starts_with("img.png:"));
    }

    #[test]
    fn missing_manifest_is_reported() {
        let err = validate(Path::new("/no/such/data.yaml")).unwrap_err();
        assert!(matches!(err, DatasetError::MissingFile { .. }));
    }
}
