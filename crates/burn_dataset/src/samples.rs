//! Indexing and loading image/label pairs from a split directory.

use crate::types::{DatasetError, DatasetResult};
use crate::validation::validate_sample;
use data_contracts::{BoundingBoxAnnotation, DetectionSample};
use std::fs;
use std::path::{Path, PathBuf};

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];
pub const LABEL_EXTENSION: &str = "txt";

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn list_files(dir: &Path, allowed: &[&str]) -> DatasetResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| DatasetError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DatasetError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        if path.is_file() && has_extension(&path, allowed) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Image files directly under `dir`, sorted by path.
pub fn list_images(dir: &Path) -> DatasetResult<Vec<PathBuf>> {
    list_files(dir, IMAGE_EXTENSIONS)
}

/// Label files directly under `dir`, sorted by path.
pub fn list_labels(dir: &Path) -> DatasetResult<Vec<PathBuf>> {
    list_files(dir, &[LABEL_EXTENSION])
}

/// `labels/<image-stem>.txt` for an image.
pub fn label_path_for(image: &Path, labels_dir: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    let mut name = stem;
    name.push(".");
    name.push(LABEL_EXTENSION);
    labels_dir.join(name)
}

/// Parse a label file; a missing file means a background image with no boxes.
pub fn read_annotations(label_path: &Path) -> DatasetResult<Vec<BoundingBoxAnnotation>> {
    if !label_path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(label_path).map_err(|e| DatasetError::Io {
        path: label_path.to_path_buf(),
        source: e,
    })?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            BoundingBoxAnnotation::from_yolo_line(line).map_err(|source| DatasetError::Label {
                path: label_path.to_path_buf(),
                line: i + 1,
                source,
            })
        })
        .collect()
}

/// Load and validate every image/label pair of one split.
pub fn load_split(
    images_dir: &Path,
    labels_dir: &Path,
    num_classes: usize,
) -> DatasetResult<Vec<DetectionSample>> {
    let mut samples = Vec::new();
    for image in list_images(images_dir)? {
        let annotations = read_annotations(&label_path_for(&image, labels_dir))?;
        let sample = DetectionSample { image, annotations };
        validate_sample(&sample, num_classes)?;
        samples.push(sample);
    }
    Ok(samples)
}

pub fn load_rgb(path: &Path) -> DatasetResult<image::RgbImage> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| DatasetError::Image {
            path: path.to_path_buf(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_path_uses_image_stem() {
        let p = label_path_for(Path::new("/d/images/frame_01.JPG"), Path::new("/d/labels"));
        assert_eq!(p, PathBuf::from("/d/labels/frame_01.txt"));
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        assert!(has_extension(Path::new("a.PNG"), IMAGE_EXTENSIONS));
        assert!(!has_extension(Path::new("a.gif"), IMAGE_EXTENSIONS));
        assert!(!has_extension(Path::new("noext"), IMAGE_EXTENSIONS));
    }

    #[test]
    fn missing_label_file_is_background() {
        let anns = read_annotations(Path::new("/definitely/not/here.txt")).unwrap();
        assert!(anns.is_empty());
    }
}
