//! Calibration inputs for post-training quantization.

use burn_dataset::{list_images, DatasetResult, SourceImage, ValidatedDataset};
use data_contracts::DetectionSample;
use std::path::PathBuf;
use tracing::debug;

pub const DEFAULT_CALIBRATION_SAMPLES: usize = 100;

/// One `[1, 3, S, S]` input in `[0, 1]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSample {
    pub side: usize,
    pub pixels: Vec<f32>,
}

/// Finite, restartable source of representative inputs.
pub trait CalibrationStream {
    /// `None` once every sample has been yielded.
    fn next_sample(&mut self) -> Option<DatasetResult<CalibrationSample>>;
    /// Rewind to the first sample.
    fn reset(&mut self);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Letterboxed, un-augmented training images.
pub struct DatasetCalibrationStream {
    images: Vec<PathBuf>,
    side: u32,
    cursor: usize,
}

impl DatasetCalibrationStream {
    /// First `cap` training images in path order.
    pub fn new(dataset: &ValidatedDataset, side: u32, cap: usize) -> DatasetResult<Self> {
        let mut images = list_images(&dataset.manifest.train_path)?;
        images.truncate(cap);
        debug!(samples = images.len(), side, "calibration stream ready");
        Ok(Self {
            images,
            side,
            cursor: 0,
        })
    }
}

impl CalibrationStream for DatasetCalibrationStream {
    fn next_sample(&mut self) -> Option<DatasetResult<CalibrationSample>> {
        let image = self.images.get(self.cursor)?.clone();
        self.cursor += 1;
        let sample = DetectionSample {
            image,
            annotations: Vec::new(),
        };
        Some(SourceImage::load(&sample, self.side).map(|src| CalibrationSample {
            side: self.side as usize,
            pixels: src.into_sample().image_chw,
        }))
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}
