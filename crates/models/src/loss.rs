//! Detection loss: box regression, confidence and classification terms.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::detector::DetectionOutput;

const EPS: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub boxes: f32,
    pub confidence: f32,
    pub classes: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            boxes: 1.0,
            confidence: 1.0,
            classes: 1.0,
        }
    }
}

/// Per-term losses for one batch; every tensor has shape `[1]`.
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    pub total: Tensor<B, 1>,
    pub boxes: Tensor<B, 1>,
    pub confidence: Tensor<B, 1>,
    pub classes: Tensor<B, 1>,
}

/// Host-side scalars of a `LossTerms`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossValues {
    pub total: f32,
    pub boxes: f32,
    pub confidence: f32,
    pub classes: f32,
}

fn scalar<B: Backend>(t: &Tensor<B, 1>) -> f32 {
    t.clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(f32::NAN)
}

impl<B: Backend> LossTerms<B> {
    pub fn values(&self) -> LossValues {
        LossValues {
            total: scalar(&self.total),
            boxes: scalar(&self.boxes),
            confidence: scalar(&self.confidence),
            classes: scalar(&self.classes),
        }
    }
}

/// Matched targets for one batch.
pub struct Targets<B: Backend> {
    /// `[B, M]`, 1.0 on slots matched to a ground-truth box.
    pub obj: Tensor<B, 2>,
    /// `[B, M, 4]`
    pub boxes: Tensor<B, 3>,
    /// `[B, M, 4]`, 1.0 on matched slots.
    pub box_weights: Tensor<B, 3>,
    /// `[B, M, nc]` one-hot on matched slots.
    pub classes: Tensor<B, 3>,
    pub matched: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionLoss {
    pub weights: LossWeights,
}

impl DetectionLoss {
    pub fn new(weights: LossWeights) -> Self {
        Self { weights }
    }

    pub fn forward<B: Backend>(
        &self,
        output: &DetectionOutput<B>,
        gt_boxes: Tensor<B, 3>,
        gt_mask: Tensor<B, 2>,
        gt_classes: Tensor<B, 2>,
    ) -> LossTerms<B> {
        let targets = build_greedy_targets(output, gt_boxes, gt_mask, gt_classes);
        let device = output.boxes.device();
        let zero = || Tensor::<B, 1>::from_data(TensorData::new(vec![0.0f32], [1]), &device);

        // Confidence BCE over every slot; unassigned slots stay at 0.0.
        let [batch, slots] = targets.obj.dims();
        let p = output.confidence.clone().clamp(EPS, 1.0 - EPS);
        let obj_inv = targets.obj.clone().neg().add_scalar(1.0);
        let confidence = -(targets.obj.clone() * p.clone().log()
            + obj_inv * p.neg().add_scalar(1.0).log())
        .sum()
        .div_scalar((batch * slots).max(1) as f32);

        let (boxes, classes) = if targets.matched > 0 {
            let n = targets.matched as f32;
            let err = (output.boxes.clone() - targets.boxes) * targets.box_weights;
            let boxes = (err.clone() * err).sum().div_scalar(n * 4.0);
            let log_p = output.class_probs.clone().clamp(EPS, 1.0).log();
            let classes = -(targets.classes * log_p).sum().div_scalar(n);
            (boxes, classes)
        } else {
            (zero(), zero())
        };

        let total = boxes.clone() * self.weights.boxes
            + confidence.clone() * self.weights.confidence
            + classes.clone() * self.weights.classes;
        LossTerms {
            total,
            boxes,
            confidence,
            classes,
        }
    }
}

pub fn iou_xyxy(a: [f32; 4], b: [f32; 4]) -> f32 {
    let ax0 = a[0].min(a[2]);
    let ay0 = a[1].min(a[3]);
    let ax1 = a[0].max(a[2]);
    let ay1 = a[1].max(a[3]);
    let bx0 = b[0].min(b[2]);
    let by0 = b[1].min(b[3]);
    let bx1 = b[0].max(b[2]);
    let by1 = b[1].max(b[3]);

    let inter_w = (ax1.min(bx1) - ax0.max(bx0)).max(0.0);
    let inter_h = (ay1.min(by1) - ay0.max(by0)).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (ax1 - ax0).max(0.0) * (ay1 - ay0).max(0.0);
    let area_b = (bx1 - bx0).max(0.0) * (by1 - by0).max(0.0);
    let denom = area_a + area_b - inter_area;
    if denom <= 0.0 {
        0.0
    } else {
        inter_area / denom
    }
}

/// Greedy matching: each ground-truth box, in order, takes the free predicted
/// slot with the highest IoU. Ground truth beyond the slot count is dropped.
pub fn build_greedy_targets<B: Backend>(
    output: &DetectionOutput<B>,
    gt_boxes: Tensor<B, 3>,
    gt_mask: Tensor<B, 2>,
    gt_classes: Tensor<B, 2>,
) -> Targets<B> {
    let [batch, max_pred, nc] = output.class_probs.dims();
    let max_gt = gt_boxes.dims()[1];
    let device = output.boxes.device();

    let gt_mask_vec = gt_mask.into_data().to_vec::<f32>().unwrap_or_default();
    let gt_boxes_vec = gt_boxes.into_data().to_vec::<f32>().unwrap_or_default();
    let gt_classes_vec = gt_classes.into_data().to_vec::<f32>().unwrap_or_default();
    let pred_boxes_vec = output
        .boxes
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default();

    let mut obj_targets = vec![0.0f32; batch * max_pred];
    let mut box_targets = vec![0.0f32; batch * max_pred * 4];
    let mut box_weights = vec![0.0f32; batch * max_pred * 4];
    let mut class_targets = vec![0.0f32; batch * max_pred * nc];
    let mut matched = 0usize;

    for b in 0..batch {
        let mut taken = vec![false; max_pred];
        for g in 0..max_gt {
            let gi = b * max_gt + g;
            if gt_mask_vec.get(gi).copied().unwrap_or(0.0) < 0.5 {
                continue;
            }
            let gb = [
                gt_boxes_vec[gi * 4],
                gt_boxes_vec[gi * 4 + 1],
                gt_boxes_vec[gi * 4 + 2],
                gt_boxes_vec[gi * 4 + 3],
            ];

            let mut best: Option<(usize, f32)> = None;
            for p in (0..max_pred).filter(|&p| !taken[p]) {
                let pi = (b * max_pred + p) * 4;
                let pb = [
                    pred_boxes_vec[pi],
                    pred_boxes_vec[pi + 1],
                    pred_boxes_vec[pi + 2],
                    pred_boxes_vec[pi + 3],
                ];
                let iou = iou_xyxy(pb, gb);
                if best.map_or(true, |(_, best_iou)| iou > best_iou) {
                    best = Some((p, iou));
                }
            }
            let Some((p, _)) = best else {
                break;
            };
            taken[p] = true;
            matched += 1;

            let slot = b * max_pred + p;
            obj_targets[slot] = 1.0;
            box_targets[slot * 4..slot * 4 + 4].copy_from_slice(&gb);
            box_weights[slot * 4..slot * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
            let class = (gt_classes_vec.get(gi).copied().unwrap_or(0.0).round() as usize)
                .min(nc.saturating_sub(1));
            class_targets[slot * nc + class] = 1.0;
        }
    }

    Targets {
        obj: Tensor::from_data(TensorData::new(obj_targets, [batch, max_pred]), &device),
        boxes: Tensor::from_data(TensorData::new(box_targets, [batch, max_pred, 4]), &device),
        box_weights: Tensor::from_data(
            TensorData::new(box_weights, [batch, max_pred, 4]),
            &device,
        ),
        classes: Tensor::from_data(
            TensorData::new(class_targets, [batch, max_pred, nc]),
            &device,
        ),
        matched,
    }
}
