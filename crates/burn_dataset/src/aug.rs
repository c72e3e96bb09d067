//! Image augmentation and transformation pipeline.
//!
//! The policy simulates what a sideline phone camera sees: geometric jitter
//! for camera angle and distance, photometric jitter for stadium lighting, and
//! composite transforms (mosaic, mixup, copy-paste) for crowded scenes and
//! occlusion. All boxes stay normalized corner form in `[0, 1]`.

use crate::samples::load_rgb;
use crate::types::{DatasetResult, DatasetSample};
use data_contracts::DetectionSample;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, translate, Interpolation};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::cmp::max;

/// Boxes thinner than this many pixels after augmentation are dropped.
const MIN_BOX_PIXELS: f32 = 2.0;
/// Largest fraction of an existing box a copy-paste crop may cover.
const PASTE_MAX_OCCLUSION: f32 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationPolicy {
    /// Max absolute rotation in degrees.
    pub rotation_degrees: f32,
    /// Zoom range as a fraction; scale is drawn from `[1 - zoom, 1 + zoom]`.
    pub zoom: f32,
    /// Max translation as a fraction of the image side.
    pub translate: f32,
    pub flip_horizontal_prob: f32,
    /// Max brightness delta as a fraction.
    pub brightness: f32,
    /// Max contrast delta as a fraction.
    pub contrast: f32,
    /// Max hue rotation as a fraction of the full circle.
    pub hue: f32,
    /// Max saturation delta as a fraction.
    pub saturation: f32,
    pub mosaic_prob: f32,
    pub mixup_prob: f32,
    pub copy_paste_prob: f32,
}

impl Default for AugmentationPolicy {
    fn default() -> Self {
        Self {
            rotation_degrees: 15.0,
            zoom: 0.2,
            translate: 0.1,
            flip_horizontal_prob: 0.5,
            brightness: 0.3,
            contrast: 0.2,
            hue: 0.015,
            saturation: 0.7,
            mosaic_prob: 1.0,
            mixup_prob: 0.1,
            copy_paste_prob: 0.1,
        }
    }
}

impl AugmentationPolicy {
    /// Policy that leaves images untouched apart from letterboxing.
    pub fn disabled() -> Self {
        Self {
            rotation_degrees: 0.0,
            zoom: 0.0,
            translate: 0.0,
            flip_horizontal_prob: 0.0,
            brightness: 0.0,
            contrast: 0.0,
            hue: 0.0,
            saturation: 0.0,
            mosaic_prob: 0.0,
            mixup_prob: 0.0,
            copy_paste_prob: 0.0,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "rotation={:.1}deg zoom={:.2} translate={:.2} fliplr_p={:.2} brightness={:.2} contrast={:.2} hue={:.3} saturation={:.2} mosaic_p={:.2} mixup_p={:.2} copy_paste_p={:.2}",
            self.rotation_degrees,
            self.zoom,
            self.translate,
            self.flip_horizontal_prob,
            self.brightness,
            self.contrast,
            self.hue,
            self.saturation,
            self.mosaic_prob,
            self.mixup_prob,
            self.copy_paste_prob,
        )
    }
}

/// A decoded, letterboxed image with its boxes, before augmentation.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub image: RgbImage,
    pub boxes: Vec<[f32; 4]>,
    pub classes: Vec<u32>,
}

impl SourceImage {
    /// Decode `sample` and letterbox it to a `size`x`size` canvas.
    pub fn load(sample: &DetectionSample, size: u32) -> DatasetResult<Self> {
        let img = load_rgb(&sample.image)?;
        let mut boxes: Vec<[f32; 4]> = sample.annotations.iter().map(|a| a.clamped()).collect();
        let classes = sample.annotations.iter().map(|a| a.class_id).collect();
        let image = letterbox(&img, size, &mut boxes);
        Ok(Self {
            image,
            boxes,
            classes,
        })
    }

    pub fn into_sample(self) -> DatasetSample {
        let (width, height) = self.image.dimensions();
        DatasetSample {
            image_chw: to_chw(&self.image),
            width,
            height,
            boxes: self.boxes,
            classes: self.classes,
        }
    }

    fn retain_boxes(&mut self, min_side: f32) {
        let mut kept_boxes = Vec::with_capacity(self.boxes.len());
        let mut kept_classes = Vec::with_capacity(self.classes.len());
        for (b, c) in self.boxes.iter().zip(&self.classes) {
            if b[2] - b[0] >= min_side && b[3] - b[1] >= min_side {
                kept_boxes.push(*b);
                kept_classes.push(*c);
            }
        }
        self.boxes = kept_boxes;
        self.classes = kept_classes;
    }
}

#[derive(Debug, Clone)]
pub struct TransformPipeline {
    pub policy: AugmentationPolicy,
    pub target_size: u32,
}

impl TransformPipeline {
    pub fn new(policy: AugmentationPolicy, target_size: u32) -> Self {
        Self {
            policy,
            target_size,
        }
    }

    /// Augment `primary`. `partner` draws another letterboxed training image
    /// for the composite transforms.
    pub fn apply(
        &self,
        primary: SourceImage,
        partner: &dyn Fn(&mut dyn RngCore) -> DatasetResult<SourceImage>,
        rng: &mut dyn RngCore,
    ) -> DatasetResult<DatasetSample> {
        let p = &self.policy;
        let mut src = primary;

        if roll(rng, p.mosaic_prob) {
            let tiles = [src, partner(rng)?, partner(rng)?, partner(rng)?];
            src = mosaic(tiles, self.target_size);
        }
        if roll(rng, p.mixup_prob) {
            let other = partner(rng)?;
            let lambda = rng.random_range(0.4f32..0.6);
            mixup(&mut src, other, lambda);
        }
        if roll(rng, p.copy_paste_prob) {
            let other = partner(rng)?;
            copy_paste(&mut src, &other, rng);
        }

        if p.rotation_degrees > 0.0 {
            let deg = rng.random_range(-p.rotation_degrees..p.rotation_degrees);
            rotate(&mut src.image, &mut src.boxes, deg.to_radians());
        }
        if p.zoom > 0.0 {
            maybe_scale_jitter(
                &mut src.image,
                &mut src.boxes,
                1.0,
                (1.0 - p.zoom).max(0.05),
                1.0 + p.zoom,
                rng,
            );
        }
        if p.translate > 0.0 {
            let tx = rng.random_range(-p.translate..p.translate);
            let ty = rng.random_range(-p.translate..p.translate);
            shift(&mut src.image, &mut src.boxes, tx, ty);
        }
        maybe_hflip(&mut src.image, &mut src.boxes, p.flip_horizontal_prob, rng);

        adjust_brightness_contrast(&mut src.image, p.brightness, p.contrast, rng);
        adjust_hue_saturation(&mut src.image, p.hue, p.saturation, rng);

        src.retain_boxes(MIN_BOX_PIXELS / self.target_size as f32);
        Ok(src.into_sample())
    }
}

fn roll(rng: &mut dyn RngCore, prob: f32) -> bool {
    prob > 0.0 && rng.random_range(0.0f32..1.0) < prob
}

fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut image_chw = vec![0.0f32; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let base = (y * width + x) as usize;
        image_chw[base] = pixel[0] as f32 / 255.0;
        image_chw[plane + base] = pixel[1] as f32 / 255.0;
        image_chw[2 * plane + base] = pixel[2] as f32 / 255.0;
    }
    image_chw
}

/// Resize preserving aspect ratio onto a zero-padded square canvas, remapping boxes.
pub fn letterbox(img: &RgbImage, size: u32, boxes: &mut [[f32; 4]]) -> RgbImage {
    let (w, h) = img.dimensions();
    let scale = f32::min(size as f32 / w as f32, size as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);
    let resized = image::imageops::resize(img, new_w, new_h, FilterType::Triangle);

    let pad_w = (size - new_w) / 2;
    let pad_h = (size - new_h) / 2;
    let mut canvas = RgbImage::new(size, size);
    image::imageops::replace(&mut canvas, &resized, pad_w.into(), pad_h.into());

    let sx = new_w as f32 / size as f32;
    let sy = new_h as f32 / size as f32;
    let ox = pad_w as f32 / size as f32;
    let oy = pad_h as f32 / size as f32;
    for b in boxes.iter_mut() {
        *b = [
            (b[0] * sx + ox).clamp(0.0, 1.0),
            (b[1] * sy + oy).clamp(0.0, 1.0),
            (b[2] * sx + ox).clamp(0.0, 1.0),
            (b[3] * sy + oy).clamp(0.0, 1.0),
        ];
    }
    canvas
}

/// 2x2 grid of four images, each downscaled into one quadrant.
fn mosaic(tiles: [SourceImage; 4], size: u32) -> SourceImage {
    let half = max(1, size / 2);
    let mut canvas = RgbImage::new(size, size);
    let mut boxes = Vec::new();
    let mut classes = Vec::new();
    for (i, tile) in tiles.into_iter().enumerate() {
        let (qx, qy) = ((i % 2) as u32, (i / 2) as u32);
        let small = image::imageops::resize(&tile.image, half, half, FilterType::Triangle);
        image::imageops::replace(&mut canvas, &small, (qx * half).into(), (qy * half).into());
        let fx = half as f32 / size as f32;
        let ox = (qx * half) as f32 / size as f32;
        let oy = (qy * half) as f32 / size as f32;
        for (b, c) in tile.boxes.iter().zip(tile.classes) {
            boxes.push([b[0] * fx + ox, b[1] * fx + oy, b[2] * fx + ox, b[3] * fx + oy]);
            classes.push(c);
        }
    }
    SourceImage {
        image: canvas,
        boxes,
        classes,
    }
}

/// Pixel blend `lambda * base + (1 - lambda) * other`; boxes from both survive.
fn mixup(base: &mut SourceImage, other: SourceImage, lambda: f32) {
    let other_img = if other.image.dimensions() == base.image.dimensions() {
        other.image
    } else {
        let (w, h) = base.image.dimensions();
        image::imageops::resize(&other.image, w, h, FilterType::Triangle)
    };
    for (dst, src) in base.image.pixels_mut().zip(other_img.pixels()) {
        for c in 0..3 {
            let v = dst[c] as f32 * lambda + src[c] as f32 * (1.0 - lambda);
            dst[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    base.boxes.extend(other.boxes);
    base.classes.extend(other.classes);
}

/// Paste box crops from `other` at their own location. A crop is skipped when
/// it would hide `PASTE_MAX_OCCLUSION` or more of any box already present.
fn copy_paste(base: &mut SourceImage, other: &SourceImage, rng: &mut dyn RngCore) {
    let (w, h) = base.image.dimensions();
    for (b, c) in other.boxes.iter().zip(&other.classes) {
        if rng.random_range(0.0f32..1.0) >= 0.5 {
            continue;
        }
        if base
            .boxes
            .iter()
            .any(|existing| overlap_of(existing, b) >= PASTE_MAX_OCCLUSION)
        {
            continue;
        }
        let x0 = (b[0] * w as f32) as u32;
        let y0 = (b[1] * h as f32) as u32;
        let x1 = ((b[2] * w as f32).ceil() as u32).min(w);
        let y1 = ((b[3] * h as f32).ceil() as u32).min(h);
        if x1 <= x0 || y1 <= y0 {
            continue;
        }
        let patch = image::imageops::crop_imm(&other.image, x0, y0, x1 - x0, y1 - y0).to_image();
        image::imageops::replace(&mut base.image, &patch, x0.into(), y0.into());
        base.boxes.push(*b);
        base.classes.push(*c);
    }
}

/// Fraction of `a` covered by `b`.
fn overlap_of(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let area = (a[2] - a[0]) * (a[3] - a[1]);
    if area <= 0.0 {
        0.0
    } else {
        iw * ih / area
    }
}

/// Rotate clockwise about the center; boxes become the axis-aligned hull of
/// their rotated corners.
pub(crate) fn rotate(img: &mut RgbImage, boxes: &mut [[f32; 4]], theta: f32) {
    let (w, h) = img.dimensions();
    *img = rotate_about_center(img, theta, Interpolation::Bilinear, Rgb([0, 0, 0]));
    let (sin, cos) = theta.sin_cos();
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
    for b in boxes.iter_mut() {
        let corners = [
            (b[0], b[1]),
            (b[2], b[1]),
            (b[0], b[3]),
            (b[2], b[3]),
        ];
        let mut x_min = f32::MAX;
        let mut y_min = f32::MAX;
        let mut x_max = f32::MIN;
        let mut y_max = f32::MIN;
        for (nx, ny) in corners {
            let dx = nx * w as f32 - cx;
            let dy = ny * h as f32 - cy;
            let rx = cx + dx * cos - dy * sin;
            let ry = cy + dx * sin + dy * cos;
            x_min = x_min.min(rx);
            y_min = y_min.min(ry);
            x_max = x_max.max(rx);
            y_max = y_max.max(ry);
        }
        *b = [
            (x_min / w as f32).clamp(0.0, 1.0),
            (y_min / h as f32).clamp(0.0, 1.0),
            (x_max / w as f32).clamp(0.0, 1.0),
            (y_max / h as f32).clamp(0.0, 1.0),
        ];
    }
}

/// Translate by a fraction of the image side; uncovered pixels become black.
pub(crate) fn shift(img: &mut RgbImage, boxes: &mut [[f32; 4]], tx: f32, ty: f32) {
    let (w, h) = img.dimensions();
    let px = (tx * w as f32).round() as i32;
    let py = (ty * h as f32).round() as i32;
    *img = translate(img, (px, py));
    let dx = px as f32 / w as f32;
    let dy = py as f32 / h as f32;
    for b in boxes.iter_mut() {
        *b = [
            (b[0] + dx).clamp(0.0, 1.0),
            (b[1] + dy).clamp(0.0, 1.0),
            (b[2] + dx).clamp(0.0, 1.0),
            (b[3] + dy).clamp(0.0, 1.0),
        ];
    }
}

pub(crate) fn maybe_hflip(
    img: &mut RgbImage,
    boxes: &mut [[f32; 4]],
    prob: f32,
    rng: &mut dyn RngCore,
) {
    if !roll(rng, prob) {
        return;
    }
    image::imageops::flip_horizontal_in_place(img);
    for b in boxes.iter_mut() {
        let x0 = b[0];
        let x1 = b[2];
        b[0] = (1.0 - x1).clamp(0.0, 1.0);
        b[2] = (1.0 - x0).clamp(0.0, 1.0);
    }
}

pub(crate) fn adjust_brightness_contrast(
    img: &mut RgbImage,
    brightness: f32,
    contrast: f32,
    rng: &mut dyn RngCore,
) {
    if brightness <= 0.0 && contrast <= 0.0 {
        return;
    }
    let bright = if brightness > 0.0 {
        1.0 + rng.random_range(-brightness..brightness)
    } else {
        1.0
    };
    let contrast = if contrast > 0.0 {
        1.0 + rng.random_range(-contrast..contrast)
    } else {
        1.0
    };
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            let mut v = (v - 0.5) * contrast + 0.5;
            v *= bright;
            pixel[c] = (v.clamp(0.0, 1.0) * 255.0) as u8;
        }
    }
}

pub(crate) fn adjust_hue_saturation(
    img: &mut RgbImage,
    hue: f32,
    saturation: f32,
    rng: &mut dyn RngCore,
) {
    if hue > 0.0 {
        let degrees = rng.random_range(-hue..hue) * 360.0;
        let degrees = degrees.round() as i32;
        if degrees != 0 {
            *img = image::imageops::huerotate(img, degrees);
        }
    }
    if saturation > 0.0 {
        let factor = (1.0 + rng.random_range(-saturation..saturation)).max(0.0);
        for pixel in img.pixels_mut() {
            let gray =
                0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
            for c in 0..3 {
                let v = gray + (pixel[c] as f32 - gray) * factor;
                pixel[c] = v.clamp(0.0, 255.0) as u8;
            }
        }
    }
}

pub(crate) fn maybe_scale_jitter(
    img: &mut RgbImage,
    boxes: &mut [[f32; 4]],
    prob: f32,
    min_scale: f32,
    max_scale: f32,
    rng: &mut dyn RngCore,
) {
    if min_scale <= 0.0 || max_scale <= min_scale || !roll(rng, prob) {
        return;
    }
    let scale = rng.random_range(min_scale..max_scale);
    let (w, h) = img.dimensions();
    let new_w = max(1, (w as f32 * scale).round() as u32);
    let new_h = max(1, (h as f32 * scale).round() as u32);

    let resized = image::imageops::resize(img, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::new(w, h);

    // Crop center when zooming in, pad center when zooming out.
    let (x0, y0) = if new_w >= w && new_h >= h {
        (-(((new_w - w) / 2) as i64), -(((new_h - h) / 2) as i64))
    } else {
        (
            (w as i64 - new_w as i64) / 2,
            (h as i64 - new_h as i64) / 2,
        )
    };
    image::imageops::replace(&mut canvas, &resized, x0, y0);
    for b in boxes.iter_mut() {
        let px0 = (b[0] * w as f32 * scale + x0 as f32).clamp(0.0, w as f32);
        let py0 = (b[1] * h as f32 * scale + y0 as f32).clamp(0.0, h as f32);
        let px1 = (b[2] * w as f32 * scale + x0 as f32).clamp(px0, w as f32);
        let py1 = (b[3] * h as f32 * scale + y0 as f32).clamp(py0, h as f32);
        b[0] = px0 / w as f32;
        b[1] = py0 / h as f32;
        b[2] = px1 / w as f32;
        b[3] = py1 / h as f32;
    }

    *img = canvas;
}
