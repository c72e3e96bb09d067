//! Named f32 parameter tables for exporters.
//!
//! Names follow the module layout, e.g. `backbone.blocks.0.conv.weight` or
//! `custom_head.class_head.bias`. Order is the forward order of the layers.

use burn::module::Param;
use burn::nn::conv::Conv2d;
use burn::nn::Linear;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use std::collections::HashMap;
use thiserror::Error;

use crate::backbone::Backbone;
use crate::custom_head::CustomHead;
use crate::detector::JerseyDetector;
use crate::single_stage::GridHead;

/// One parameter tensor, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl NamedTensor {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("parameter {0} missing from table")]
    Missing(String),
    #[error("parameter {name} has shape {found:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

type Table<'a> = HashMap<&'a str, &'a NamedTensor>;

fn read<B: Backend, const D: usize>(name: String, tensor: Tensor<B, D>) -> NamedTensor {
    let shape = tensor.dims().to_vec();
    let values = tensor.into_data().to_vec::<f32>().unwrap_or_default();
    NamedTensor {
        name,
        shape,
        values,
    }
}

fn write<B: Backend, const D: usize>(
    table: &Table<'_>,
    name: &str,
    like: Tensor<B, D>,
) -> Result<Tensor<B, D>, ParamError> {
    let entry = table
        .get(name)
        .ok_or_else(|| ParamError::Missing(name.to_string()))?;
    let dims = like.dims();
    let expected: usize = dims.iter().product();
    if entry.shape != dims.to_vec() || entry.values.len() != expected {
        return Err(ParamError::Shape {
            name: name.to_string(),
            expected: dims.to_vec(),
            found: entry.shape.clone(),
        });
    }
    Ok(Tensor::<B, 1>::from_floats(entry.values.as_slice(), &like.device()).reshape(dims))
}

trait ParamIo: Sized {
    fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>);
    fn import(self, prefix: &str, table: &Table<'_>) -> Result<Self, ParamError>;
}

macro_rules! weight_bias_io {
    ($layer:ident) => {
        impl<B: Backend> ParamIo for $layer<B> {
            fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
                out.push(read(format!("{prefix}.weight"), self.weight.val()));
                if let Some(bias) = &self.bias {
                    out.push(read(format!("{prefix}.bias"), bias.val()));
                }
            }

            fn import(mut self, prefix: &str, table: &Table<'_>) -> Result<Self, ParamError> {
                let weight = write(table, &format!("{prefix}.weight"), self.weight.val())?;
                self.weight = Param::from_tensor(weight);
                if let Some(bias) = self.bias.take() {
                    let bias = write(table, &format!("{prefix}.bias"), bias.val())?;
                    self.bias = Some(Param::from_tensor(bias));
                }
                Ok(self)
            }
        }
    };
}

weight_bias_io!(Conv2d);
weight_bias_io!(Linear);

impl<B: Backend> ParamIo for Backbone<B> {
    fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        for (i, block) in self.blocks.iter().enumerate() {
            block.conv.export(&format!("{prefix}.blocks.{i}.conv"), out);
        }
    }

    fn import(mut self, prefix: &str, table: &Table<'_>) -> Result<Self, ParamError> {
        let blocks = std::mem::take(&mut self.blocks);
        for (i, mut block) in blocks.into_iter().enumerate() {
            block.conv = block.conv.import(&format!("{prefix}.blocks.{i}.conv"), table)?;
            self.blocks.push(block);
        }
        Ok(self)
    }
}

impl<B: Backend> ParamIo for CustomHead<B> {
    fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        self.hidden.export(&format!("{prefix}.hidden"), out);
        self.box_head.export(&format!("{prefix}.box_head"), out);
        self.confidence_head
            .export(&format!("{prefix}.confidence_head"), out);
        self.class_head.export(&format!("{prefix}.class_head"), out);
    }

    fn import(mut self, prefix: &str, table: &Table<'_>) -> Result<Self, ParamError> {
        self.hidden = self.hidden.import(&format!("{prefix}.hidden"), table)?;
        self.box_head = self.box_head.import(&format!("{prefix}.box_head"), table)?;
        self.confidence_head = self
            .confidence_head
            .import(&format!("{prefix}.confidence_head"), table)?;
        self.class_head = self.class_head.import(&format!("{prefix}.class_head"), table)?;
        Ok(self)
    }
}

impl<B: Backend> ParamIo for GridHead<B> {
    fn export(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        self.head_obj.export(&format!("{prefix}.head_obj"), out);
        self.head_box.export(&format!("{prefix}.head_box"), out);
        self.head_cls.export(&format!("{prefix}.head_cls"), out);
    }

    fn import(mut self, prefix: &str, table: &Table<'_>) -> Result<Self, ParamError> {
        self.head_obj = self.head_obj.import(&format!("{prefix}.head_obj"), table)?;
        self.head_box = self.head_box.import(&format!("{prefix}.head_box"), table)?;
        self.head_cls = self.head_cls.import(&format!("{prefix}.head_cls"), table)?;
        Ok(self)
    }
}

impl<B: Backend> JerseyDetector<B> {
    /// Every trainable tensor with its layout name.
    pub fn named_tensors(&self) -> Vec<NamedTensor> {
        let mut out = Vec::new();
        self.backbone.export("backbone", &mut out);
        if let Some(head) = &self.custom_head {
            head.export("custom_head", &mut out);
        }
        if let Some(head) = &self.grid_head {
            head.export("grid_head", &mut out);
        }
        out
    }

    /// Replace every parameter with the matching entry of `tensors`.
    /// Names and shapes must match `named_tensors` exactly.
    pub fn with_named_tensors(mut self, tensors: &[NamedTensor]) -> Result<Self, ParamError> {
        let table: Table<'_> = tensors.iter().map(|t| (t.name.as_str(), t)).collect();
        self.backbone = self.backbone.import("backbone", &table)?;
        if let Some(head) = self.custom_head.take() {
            self.custom_head = Some(head.import("custom_head", &table)?);
        }
        if let Some(head) = self.grid_head.take() {
            self.grid_head = Some(head.import("grid_head", &table)?);
        }
        Ok(self)
    }
}
