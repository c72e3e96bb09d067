//! Single-stage grid detector head.
//!
//! Backbone features are pooled to a `g x g` grid (`g = ceil(sqrt(max_det))`).
//! Each of the first `max_det` cells predicts one box relative to the cell,
//! an objectness score, and class logits via 1x1 convolutions.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::{sigmoid, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::detector::DetectionOutput;

pub fn grid_side(max_detections: usize) -> usize {
    let mut g = 1;
    while g * g < max_detections {
        g += 1;
    }
    g
}

fn head_conv<B: Backend>(in_channels: usize, out: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out], [1, 1])
        .with_padding(PaddingConfig2d::Valid)
        .init(device)
}

#[derive(Module, Debug)]
pub struct GridHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    pub(crate) head_obj: Conv2d<B>,
    pub(crate) head_box: Conv2d<B>,
    pub(crate) head_cls: Conv2d<B>,
    in_channels: usize,
    grid: usize,
    max_detections: usize,
    num_classes: usize,
}

impl<B: Backend> GridHead<B> {
    pub fn new(
        in_channels: usize,
        max_detections: usize,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        let grid = grid_side(max_detections);
        Self {
            pool: AdaptiveAvgPool2dConfig::new([grid, grid]).init(),
            head_obj: head_conv(in_channels, 1, device),
            head_box: head_conv(in_channels, 4, device),
            head_cls: head_conv(in_channels, num_classes, device),
            in_channels,
            grid,
            max_detections,
            num_classes,
        }
    }

    /// Swap the class head for a freshly initialised one over `num_classes`.
    /// Backbone, box and objectness weights are kept.
    pub fn retarget(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.head_cls = head_conv(self.in_channels, num_classes, device);
        self.num_classes = num_classes;
        self
    }

    pub fn forward(&self, features: Tensor<B, 4>) -> DetectionOutput<B> {
        let batch = features.dims()[0];
        let (g, m, nc) = (self.grid, self.max_detections, self.num_classes);
        let cells = g * g;
        let x = self.pool.forward(features);

        let confidence = sigmoid(
            self.head_obj
                .forward(x.clone())
                .reshape([batch, cells])
                .slice([0..batch, 0..m]),
        );

        let raw = sigmoid(
            self.head_box
                .forward(x.clone())
                .reshape([batch, 4, cells])
                .swap_dims(1, 2)
                .slice([0..batch, 0..m, 0..4]),
        );
        let device = raw.device();
        let offsets = cell_offsets::<B>(g, m, &device).repeat_dim(0, batch);
        let centers =
            (raw.clone().slice([0..batch, 0..m, 0..2]) + offsets).div_scalar(g as f32);
        let half_wh = raw.slice([0..batch, 0..m, 2..4]).mul_scalar(0.5);
        let boxes = Tensor::cat(
            vec![
                (centers.clone() - half_wh.clone()).clamp(0.0, 1.0),
                (centers + half_wh).clamp(0.0, 1.0),
            ],
            2,
        );

        let class_logits = self
            .head_cls
            .forward(x)
            .reshape([batch, nc, cells])
            .swap_dims(1, 2)
            .slice([0..batch, 0..m, 0..nc]);

        DetectionOutput {
            boxes,
            confidence,
            class_probs: softmax(class_logits, 2),
        }
    }

    /// Parameter counts of (objectness, box, class) convolutions.
    pub fn layer_params(&self) -> [usize; 3] {
        [
            self.head_obj.num_params(),
            self.head_box.num_params(),
            self.head_cls.num_params(),
        ]
    }

    pub fn grid(&self) -> usize {
        self.grid
    }
}

/// `[1, m, 2]` of (column, row) per slot in row-major cell order.
fn cell_offsets<B: Backend>(grid: usize, slots: usize, device: &B::Device) -> Tensor<B, 3> {
    let mut values = Vec::with_capacity(slots * 2);
    for i in 0..slots {
        values.push((i % grid) as f32);
        values.push((i / grid) as f32);
    }
    Tensor::from_data(TensorData::new(values, [1, slots, 2]), device)
}
