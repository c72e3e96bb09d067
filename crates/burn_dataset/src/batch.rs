//! Batch iteration for training and validation.

use crate::aug::{AugmentationPolicy, SourceImage, TransformPipeline};
use crate::cache::ImageCache;
use crate::types::{DatasetResult, DatasetSample};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::DetectionSample;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Square side every image is letterboxed to.
    pub image_size: u32,
    /// Ground-truth slots per image; extra boxes are truncated.
    pub max_boxes: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub policy: AugmentationPolicy,
    /// Keep decoded, letterboxed images in memory after their first load.
    pub cache_images: bool,
}

impl BatchConfig {
    /// Un-augmented, ordered iteration for evaluation and calibration.
    pub fn evaluation(image_size: u32, max_boxes: usize) -> Self {
        Self {
            image_size,
            max_boxes,
            shuffle: false,
            seed: 0,
            policy: AugmentationPolicy::disabled(),
            cache_images: false,
        }
    }
}

pub struct BurnBatch<B: Backend> {
    /// `[B, 3, S, S]` in `[0, 1]`.
    pub images: Tensor<B, 4>,
    /// `[B, max_boxes, 4]` corner-form boxes, zero padded.
    pub boxes: Tensor<B, 3>,
    /// `[B, max_boxes]`, 1.0 where a box slot is filled.
    pub box_mask: Tensor<B, 2>,
    /// `[B, max_boxes]` class ids stored as floats.
    pub classes: Tensor<B, 2>,
}

impl<B: Backend> BurnBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ground truth per image as `(box, class)` pairs.
    pub fn targets(&self) -> Vec<Vec<([f32; 4], u32)>> {
        let [batch, max_boxes, _] = self.boxes.dims();
        let boxes = self
            .boxes
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        let mask = self
            .box_mask
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        let classes = self
            .classes
            .clone()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        (0..batch)
            .map(|b| {
                (0..max_boxes)
                    .filter(|&g| mask.get(b * max_boxes + g).copied().unwrap_or(0.0) >= 0.5)
                    .map(|g| {
                        let base = (b * max_boxes + g) * 4;
                        (
                            [boxes[base], boxes[base + 1], boxes[base + 2], boxes[base + 3]],
                            classes[b * max_boxes + g].round() as u32,
                        )
                    })
                    .collect()
            })
            .collect()
    }
}

/// Per-sample seed mixed from run seed, epoch and position (splitmix64).
pub fn sample_seed(seed: u64, epoch: usize, index: usize) -> u64 {
    let mut z = seed
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn load_source(
    cache: Option<&ImageCache>,
    sample: &DetectionSample,
    size: u32,
) -> DatasetResult<SourceImage> {
    match cache {
        Some(cache) => cache.get_or_load(sample),
        None => SourceImage::load(sample, size),
    }
}

pub struct BatchIter {
    samples: Arc<Vec<DetectionSample>>,
    cache: Option<Arc<ImageCache>>,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    cfg: BatchConfig,
    pipeline: TransformPipeline,
    processed_samples: usize,
    processed_batches: usize,
    truncated_boxes: usize,
    started: Instant,
    total_load_time: Duration,
    last_logged_samples: usize,
    images_buf: Vec<f32>,
    boxes_buf: Vec<f32>,
    mask_buf: Vec<f32>,
    classes_buf: Vec<f32>,
}

impl BatchIter {
    pub fn new(samples: Vec<DetectionSample>, cfg: BatchConfig) -> Self {
        let pipeline = TransformPipeline::new(cfg.policy.clone(), cfg.image_size);
        let order = (0..samples.len()).collect();
        let cache = cfg
            .cache_images
            .then(|| Arc::new(ImageCache::new(cfg.image_size)));
        let mut iter = Self {
            samples: Arc::new(samples),
            cache,
            order,
            cursor: 0,
            epoch: 0,
            cfg,
            pipeline,
            processed_samples: 0,
            processed_batches: 0,
            truncated_boxes: 0,
            started: Instant::now(),
            total_load_time: Duration::ZERO,
            last_logged_samples: 0,
            images_buf: Vec::new(),
            boxes_buf: Vec::new(),
            mask_buf: Vec::new(),
            classes_buf: Vec::new(),
        };
        iter.start_epoch(0);
        iter
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Images currently held by the decode cache; 0 when caching is off.
    pub fn cached_images(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }

    /// Rewind and reshuffle; augmentation draws fresh per epoch.
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.cursor = 0;
        self.order = (0..self.samples.len()).collect();
        if self.cfg.shuffle {
            let mut rng = StdRng::seed_from_u64(sample_seed(self.cfg.seed, epoch, usize::MAX));
            self.order.shuffle(&mut rng);
        }
    }

    fn load_one(&self, position: usize) -> DatasetResult<DatasetSample> {
        let idx = self.order[position];
        let size = self.cfg.image_size;
        let primary = load_source(self.cache.as_deref(), &self.samples[idx], size)?;
        let mut rng = StdRng::seed_from_u64(sample_seed(self.cfg.seed, self.epoch, idx));
        let samples = Arc::clone(&self.samples);
        let cache = self.cache.clone();
        let partner = move |rng: &mut dyn RngCore| {
            let j = rng.random_range(0..samples.len());
            load_source(cache.as_deref(), &samples[j], size)
        };
        self.pipeline.apply(primary, &partner, &mut rng)
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> DatasetResult<Option<BurnBatch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + batch_size.max(1)).min(self.order.len());
        let positions: Vec<usize> = (self.cursor..end).collect();
        self.cursor = end;

        let t_load = Instant::now();
        let loaded: Vec<DatasetResult<DatasetSample>> =
            positions.par_iter().map(|&p| self.load_one(p)).collect();
        let load_elapsed = t_load.elapsed();

        let max_boxes = self.cfg.max_boxes;
        let side = self.cfg.image_size as usize;
        self.images_buf.clear();
        self.boxes_buf.clear();
        self.mask_buf.clear();
        self.classes_buf.clear();
        for res in loaded {
            let sample = res?;
            if sample.boxes.len() > max_boxes {
                self.truncated_boxes += sample.boxes.len() - max_boxes;
            }
            self.images_buf.extend_from_slice(&sample.image_chw);
            let mut padded = vec![0.0f32; max_boxes * 4];
            let mut mask = vec![0.0f32; max_boxes];
            let mut classes = vec![0.0f32; max_boxes];
            for (i, (b, c)) in sample
                .boxes
                .iter()
                .zip(&sample.classes)
                .take(max_boxes)
                .enumerate()
            {
                padded[i * 4..i * 4 + 4].copy_from_slice(b);
                mask[i] = 1.0;
                classes[i] = *c as f32;
            }
            self.boxes_buf.extend_from_slice(&padded);
            self.mask_buf.extend_from_slice(&mask);
            self.classes_buf.extend_from_slice(&classes);
        }

        let batch_len = positions.len();
        let images = Tensor::<B, 1>::from_floats(self.images_buf.as_slice(), device)
            .reshape([batch_len, 3, side, side]);
        let boxes = Tensor::<B, 1>::from_floats(self.boxes_buf.as_slice(), device)
            .reshape([batch_len, max_boxes, 4]);
        let box_mask = Tensor::<B, 1>::from_floats(self.mask_buf.as_slice(), device)
            .reshape([batch_len, max_boxes]);
        let classes = Tensor::<B, 1>::from_floats(self.classes_buf.as_slice(), device)
            .reshape([batch_len, max_boxes]);

        self.processed_samples += batch_len;
        self.processed_batches += 1;
        self.total_load_time += load_elapsed;
        debug!(
            batch = self.processed_batches,
            samples = batch_len,
            load_ms = load_elapsed.as_secs_f64() * 1000.0,
            "assembled batch"
        );
        self.maybe_log_progress();

        Ok(Some(BurnBatch {
            images,
            boxes,
            box_mask,
            classes,
        }))
    }

    fn maybe_log_progress(&mut self) {
        let since = self
            .processed_samples
            .saturating_sub(self.last_logged_samples);
        if since < DEFAULT_LOG_EVERY_SAMPLES {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        let avg_load_ms =
            (self.total_load_time.as_secs_f64() * 1000.0) / self.processed_batches.max(1) as f64;
        info!(
            batches = self.processed_batches,
            samples = self.processed_samples,
            truncated_boxes = self.truncated_boxes,
            cached_images = self.cached_images(),
            rate = self.processed_samples as f32 / secs,
            avg_load_ms,
            "dataset progress"
        );
        self.last_logged_samples = self.processed_samples;
    }
}
