//! Decoded, letterboxed source images kept in memory across epochs.

use crate::aug::SourceImage;
use crate::types::DatasetResult;
use data_contracts::DetectionSample;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

/// Images keyed by path, letterboxed once to `size`. Augmentation always
/// works on a copy, so a hit never sees another draw's edits.
#[derive(Debug)]
pub struct ImageCache {
    size: u32,
    entries: RwLock<HashMap<PathBuf, SourceImage>>,
}

impl ImageCache {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_load(&self, sample: &DetectionSample) -> DatasetResult<SourceImage> {
        if let Some(hit) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sample.image)
        {
            return Ok(hit.clone());
        }
        let loaded = SourceImage::load(sample, self.size)?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sample.image.clone(), loaded.clone());
        Ok(loaded)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_contracts::BoundingBoxAnnotation;
    use image::{Rgb, RgbImage};

    #[test]
    fn second_lookup_is_served_without_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        RgbImage::from_pixel(40, 20, Rgb([200, 10, 10])).save(&path).unwrap();
        let sample = DetectionSample {
            image: path.clone(),
            annotations: vec![BoundingBoxAnnotation {
                class_id: 1,
                bbox: [0.1, 0.1, 0.5, 0.9],
            }],
        };
        let cache = ImageCache::new(32);
        assert!(cache.is_empty());
        let first = cache.get_or_load(&sample).unwrap();
        std::fs::remove_file(&path).unwrap();
        let second = cache.get_or_load(&sample).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(first.image, second.image);
        assert_eq!(second.image.dimensions(), (32, 32));
        assert_eq!(second.classes, vec![1]);
    }

    #[test]
    fn failed_decodes_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        let sample = DetectionSample {
            image: path,
            annotations: Vec::new(),
        };
        let cache = ImageCache::new(32);
        assert!(cache.get_or_load(&sample).is_err());
        assert!(cache.is_empty());
    }
}
