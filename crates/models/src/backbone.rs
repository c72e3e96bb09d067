//! Convolutional feature backbone shared by both detector heads.
//!
//! Shapes:
//! - Input images: `[B, 3, S, S]`
//! - Features: `[B, C, S / 2^n, S / 2^n]` for `n` blocks, `C` the last width

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Output channels per block; each block halves the spatial size.
    pub widths: Vec<usize>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            widths: vec![16, 32, 64, 128],
        }
    }
}

impl BackboneConfig {
    pub fn out_channels(&self) -> usize {
        self.widths.last().copied().unwrap_or(3)
    }

    /// Total spatial downsampling factor.
    pub fn stride(&self) -> usize {
        1usize << self.widths.len()
    }
}

/// 3x3 conv, ReLU, 2x2 max pool.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        Self { conv, pool }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(relu(self.conv.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub(crate) blocks: Vec<ConvBlock<B>>,
}

impl<B: Backend> Backbone<B> {
    pub fn new(cfg: &BackboneConfig, device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(cfg.widths.len());
        let mut in_channels = 3;
        for &width in &cfg.widths {
            blocks.push(ConvBlock::new(in_channels, width, device));
            in_channels = width;
        }
        Self { blocks }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;
        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }

    /// Per-block parameter counts, in forward order.
    pub fn block_params(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.num_params()).collect()
    }

    /// Initialise from a backbone record saved with `save_weights`.
    pub fn load_weights(self, path: &Path, device: &B::Device) -> Result<Self, RecorderError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path, &recorder, device)
    }

    pub fn save_weights(&self, path: &Path) -> Result<(), RecorderError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.clone().save_file(path, &recorder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn each_block_halves_the_feature_map() {
        let device = Default::default();
        let cfg = BackboneConfig {
            widths: vec![4, 8],
        };
        let backbone = Backbone::<NdArray<f32>>::new(&cfg, &device);
        let out = backbone.forward(Tensor::zeros([2, 3, 32, 32], &device));
        assert_eq!(out.dims(), [2, 8, 8, 8]);
        assert_eq!(cfg.stride(), 4);
        assert_eq!(backbone.block_params(), vec![3 * 4 * 9 + 4, 4 * 8 * 9 + 8]);
    }
}
