//! Detection metrics: NMS, average precision, mAP50 and mAP50-95.

use burn::tensor::backend::Backend;
use burn_dataset::{BatchConfig, BatchIter, DatasetResult};
use data_contracts::DetectionSample;
use models::{iou_xyxy, Detection, JerseyDetector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Scores below this never enter the AP computation.
pub const SCORE_FLOOR: f32 = 0.001;
/// Ground-truth slots per image when collating evaluation batches.
pub const EVAL_MAX_BOXES: usize = 100;

/// Greedy per-class non-maximum suppression, highest score first.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && iou_xyxy(k.bbox, det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}

/// All-point interpolated area under the precision/recall curve.
pub fn average_precision(recall: &[f32], precision: &[f32]) -> f32 {
    if recall.is_empty() {
        return 0.0;
    }
    let mut r = Vec::with_capacity(recall.len() + 2);
    let mut p = Vec::with_capacity(precision.len() + 2);
    r.push(0.0);
    p.push(1.0);
    r.extend_from_slice(recall);
    p.extend_from_slice(precision);
    r.push(1.0);
    p.push(0.0);
    for i in (0..p.len() - 1).rev() {
        p[i] = p[i].max(p[i + 1]);
    }
    (1..r.len())
        .map(|i| (r[i] - r[i - 1]).max(0.0) * p[i])
        .sum::<f32>()
        .clamp(0.0, 1.0)
}

/// Predictions and ground truth for one image.
#[derive(Debug, Clone, Default)]
pub struct ImageEval {
    pub detections: Vec<Detection>,
    pub ground_truth: Vec<([f32; 4], u32)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub map50: f32,
    pub map50_95: f32,
    /// At the configured confidence threshold and IoU 0.5.
    pub precision: f32,
    pub recall: f32,
    pub ap50_per_class: Vec<f32>,
    pub images: usize,
}

fn ap_for_class(images: &[ImageEval], class_id: u32, iou_threshold: f32) -> Option<f32> {
    let total_gt: usize = images
        .iter()
        .map(|img| img.ground_truth.iter().filter(|(_, c)| *c == class_id).count())
        .sum();
    if total_gt == 0 {
        return None;
    }
    let mut preds: Vec<(usize, &Detection)> = images
        .iter()
        .enumerate()
        .flat_map(|(i, img)| {
            img.detections
                .iter()
                .filter(move |d| d.class_id == class_id && d.score >= SCORE_FLOOR)
                .map(move |d| (i, d))
        })
        .collect();
    preds.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));

    let mut used: Vec<Vec<bool>> = images
        .iter()
        .map(|img| vec![false; img.ground_truth.len()])
        .collect();
    let (mut tp, mut fp) = (0usize, 0usize);
    let mut recall = Vec::with_capacity(preds.len());
    let mut precision = Vec::with_capacity(preds.len());
    for (img_idx, det) in preds {
        let mut best = (iou_threshold, None);
        for (g, (gt_box, gt_class)) in images[img_idx].ground_truth.iter().enumerate() {
            if *gt_class != class_id || used[img_idx][g] {
                continue;
            }
            let iou = iou_xyxy(det.bbox, *gt_box);
            if iou >= best.0 {
                best = (iou, Some(g));
            }
        }
        match best.1 {
            Some(g) => {
                used[img_idx][g] = true;
                tp += 1;
            }
            None => fp += 1,
        }
        recall.push(tp as f32 / total_gt as f32);
        precision.push(tp as f32 / (tp + fp) as f32);
    }
    Some(average_precision(&recall, &precision))
}

/// mAP over classes that have ground truth; 0.0 when none do.
fn mean_ap(images: &[ImageEval], num_classes: usize, iou_threshold: f32) -> (f32, Vec<f32>) {
    let per_class: Vec<Option<f32>> = (0..num_classes as u32)
        .map(|c| ap_for_class(images, c, iou_threshold))
        .collect();
    let present: Vec<f32> = per_class.iter().flatten().copied().collect();
    let map = if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f32>() / present.len() as f32
    };
    (map, per_class.into_iter().map(|ap| ap.unwrap_or(0.0)).collect())
}

fn precision_recall(images: &[ImageEval], confidence_threshold: f32) -> (f32, f32) {
    let (mut tp, mut predicted, mut total_gt) = (0usize, 0usize, 0usize);
    for img in images {
        total_gt += img.ground_truth.len();
        let mut used = vec![false; img.ground_truth.len()];
        for det in img
            .detections
            .iter()
            .filter(|d| d.score >= confidence_threshold)
        {
            predicted += 1;
            let hit = img.ground_truth.iter().enumerate().position(|(g, (b, c))| {
                !used[g] && *c == det.class_id && iou_xyxy(det.bbox, *b) >= 0.5
            });
            if let Some(g) = hit {
                used[g] = true;
                tp += 1;
            }
        }
    }
    let precision = if predicted == 0 {
        0.0
    } else {
        tp as f32 / predicted as f32
    };
    let recall = if total_gt == 0 {
        0.0
    } else {
        tp as f32 / total_gt as f32
    };
    (precision, recall)
}

/// Score already-suppressed detections against ground truth.
pub fn evaluate(images: &[ImageEval], num_classes: usize, confidence_threshold: f32) -> EvalReport {
    let (map50, ap50_per_class) = mean_ap(images, num_classes, 0.5);
    let map50_95 = (0..10)
        .map(|i| mean_ap(images, num_classes, 0.5 + 0.05 * i as f32).0)
        .sum::<f32>()
        / 10.0;
    let (precision, recall) = precision_recall(images, confidence_threshold);
    EvalReport {
        map50,
        map50_95,
        precision,
        recall,
        ap50_per_class,
        images: images.len(),
    }
}

/// Parameters of a validation pass.
#[derive(Debug, Clone, Copy)]
pub struct EvalSettings {
    pub image_size: u32,
    pub batch_size: usize,
    pub num_classes: usize,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

/// Run `detector` over `samples` (un-augmented) and compute metrics.
pub fn evaluate_detector<B: Backend>(
    detector: &JerseyDetector<B>,
    samples: Vec<DetectionSample>,
    settings: EvalSettings,
    device: &B::Device,
) -> DatasetResult<EvalReport> {
    let mut iter = BatchIter::new(
        samples,
        BatchConfig::evaluation(settings.image_size, EVAL_MAX_BOXES),
    );
    let mut images = Vec::with_capacity(iter.len());
    while let Some(batch) = iter.next_batch::<B>(settings.batch_size, device)? {
        let ground_truth = batch.targets();
        let output = detector.forward(batch.images);
        for (dets, gt) in output.detections().into_iter().zip(ground_truth) {
            let dets = dets
                .into_iter()
                .filter(|d| d.score >= SCORE_FLOOR)
                .collect();
            images.push(ImageEval {
                detections: nms(dets, settings.nms_threshold),
                ground_truth: gt,
            });
        }
        debug!(images = images.len(), "evaluated batch");
    }
    let report = evaluate(&images, settings.num_classes, settings.confidence_threshold);
    info!(
        images = report.images,
        map50 = report.map50,
        map50_95 = report.map50_95,
        precision = report.precision,
        recall = report.recall,
        "validation metrics"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], score: f32, class_id: u32) -> Detection {
        Detection {
            bbox,
            score,
            class_id,
        }
    }

    #[test]
    fn nms_suppresses_overlapping_same_class_only() {
        let dets = vec![
            det([0.1, 0.1, 0.5, 0.5], 0.9, 0),
            det([0.12, 0.1, 0.5, 0.52], 0.8, 0),
            det([0.12, 0.1, 0.5, 0.52], 0.7, 1),
            det([0.6, 0.6, 0.9, 0.9], 0.6, 0),
        ];
        let kept = nms(dets, 0.4);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].score, 0.9);
        assert!(kept.iter().all(|d| d.score != 0.8));
    }

    #[test]
    fn perfect_predictions_score_one() {
        let images = vec![
            ImageEval {
                detections: vec![det([0.1, 0.1, 0.3, 0.4], 0.95, 0)],
                ground_truth: vec![([0.1, 0.1, 0.3, 0.4], 0)],
            },
            ImageEval {
                detections: vec![
                    det([0.5, 0.5, 0.7, 0.9], 0.9, 1),
                    det([0.1, 0.2, 0.2, 0.3], 0.8, 2),
                ],
                ground_truth: vec![([0.5, 0.5, 0.7, 0.9], 1), ([0.1, 0.2, 0.2, 0.3], 2)],
            },
        ];
        let report = evaluate(&images, 3, 0.6);
        assert!((report.map50 - 1.0).abs() < 1e-6);
        assert!((report.map50_95 - 1.0).abs() < 1e-6);
        assert_eq!(report.precision, 1.0);
        assert_eq!(report.recall, 1.0);
    }

    #[test]
    fn no_predictions_score_zero() {
        let images = vec![ImageEval {
            detections: Vec::new(),
            ground_truth: vec![([0.1, 0.1, 0.3, 0.4], 0)],
        }];
        let report = evaluate(&images, 2, 0.6);
        assert_eq!(report.map50, 0.0);
        assert_eq!(report.map50_95, 0.0);
        assert_eq!(report.recall, 0.0);
    }

    #[test]
    fn wrong_class_and_loose_boxes_lower_the_score() {
        let images = vec![ImageEval {
            detections: vec![
                det([0.1, 0.1, 0.3, 0.4], 0.9, 1),
                det([0.1, 0.1, 0.36, 0.44], 0.5, 0),
            ],
            ground_truth: vec![([0.1, 0.1, 0.3, 0.4], 0)],
        }];
        let report = evaluate(&images, 2, 0.6);
        assert!((report.map50 - 1.0).abs() < 1e-6);
        assert!(report.map50_95 < report.map50);
        assert_eq!(report.precision, 0.0);
    }

    #[test]
    fn average_precision_is_bounded() {
        assert_eq!(average_precision(&[], &[]), 0.0);
        let ap = average_precision(&[0.5, 0.5, 1.0], &[1.0, 0.5, 0.66]);
        assert!(ap > 0.0 && ap <= 1.0);
    }
}
