//! Dense detection head over globally pooled backbone features.

use burn::module::Module;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::activation::{relu, sigmoid, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::detector::DetectionOutput;

#[derive(Module, Debug)]
pub struct CustomHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    pub(crate) hidden: Linear<B>,
    dropout: Dropout,
    pub(crate) box_head: Linear<B>,
    pub(crate) confidence_head: Linear<B>,
    pub(crate) class_head: Linear<B>,
    max_detections: usize,
    num_classes: usize,
}

impl<B: Backend> CustomHead<B> {
    pub fn new(
        in_channels: usize,
        hidden: usize,
        dropout: f64,
        max_detections: usize,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            hidden: LinearConfig::new(in_channels, hidden).init(device),
            dropout: DropoutConfig::new(dropout).init(),
            box_head: LinearConfig::new(hidden, max_detections * 4).init(device),
            confidence_head: LinearConfig::new(hidden, max_detections).init(device),
            class_head: LinearConfig::new(hidden, max_detections * num_classes).init(device),
            max_detections,
            num_classes,
        }
    }

    pub fn forward(&self, features: Tensor<B, 4>) -> DetectionOutput<B> {
        let [batch, channels, _, _] = features.dims();
        let x = self.pool.forward(features).reshape([batch, channels]);
        let x = self.dropout.forward(relu(self.hidden.forward(x)));

        let boxes = sigmoid(self.box_head.forward(x.clone())).reshape([
            batch,
            self.max_detections,
            4,
        ]);
        let confidence = sigmoid(self.confidence_head.forward(x.clone()));
        let class_logits =
            self.class_head
                .forward(x)
                .reshape([batch, self.max_detections, self.num_classes]);

        DetectionOutput {
            boxes: order_corners(boxes),
            confidence,
            class_probs: softmax(class_logits, 2),
        }
    }

    /// Parameter counts of (hidden, box, confidence, class) layers.
    pub fn layer_params(&self) -> [usize; 4] {
        [
            self.hidden.num_params(),
            self.box_head.num_params(),
            self.confidence_head.num_params(),
            self.class_head.num_params(),
        ]
    }
}

/// Reorder/clamp to enforce x0 <= x1, y0 <= y1 within [0,1] using arithmetic.
pub(crate) fn order_corners<B: Backend>(boxes: Tensor<B, 3>) -> Tensor<B, 3> {
    let [batch, slots, _] = boxes.dims();
    let x0 = boxes.clone().slice([0..batch, 0..slots, 0..1]);
    let y0 = boxes.clone().slice([0..batch, 0..slots, 1..2]);
    let x1 = boxes.clone().slice([0..batch, 0..slots, 2..3]);
    let y1 = boxes.slice([0..batch, 0..slots, 3..4]);

    let dx = x0.clone() - x1.clone();
    let dy = y0.clone() - y1.clone();
    let half = 0.5;

    let x_min = (x0.clone() + x1.clone() - dx.clone().abs()) * half;
    let x_max = (x0 + x1 + dx.abs()) * half;
    let y_min = (y0.clone() + y1.clone() - dy.clone().abs()) * half;
    let y_max = (y0 + y1 + dy.abs()) * half;

    Tensor::cat(
        vec![
            x_min.clamp(0.0, 1.0),
            y_min.clamp(0.0, 1.0),
            x_max.clamp(0.0, 1.0),
            y_max.clamp(0.0, 1.0),
        ],
        2,
    )
}
