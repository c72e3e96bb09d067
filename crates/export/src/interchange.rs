//! Full-precision interchange artifact in safetensors format.

use models::{ArchitectureSpec, NamedTensor};
use safetensors::tensor::{Dtype, TensorView};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::ExportError;

/// Serialize f32 tensors with the architecture and class names as metadata.
pub fn to_safetensors(
    tensors: &[NamedTensor],
    architecture: &ArchitectureSpec,
    class_names: &[String],
) -> Result<Vec<u8>, ExportError> {
    let tensor_data: Vec<(&str, Vec<u8>, Vec<usize>)> = tensors
        .iter()
        .map(|t| {
            let bytes: Vec<u8> = bytemuck::cast_slice(&t.values).to_vec();
            (t.name.as_str(), bytes, t.shape.clone())
        })
        .collect();

    let views = tensor_data
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(|source| ExportError::Tensor {
                    name: name.to_string(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut metadata = HashMap::new();
    metadata.insert(
        "architecture".to_string(),
        serde_json::to_string(architecture)?,
    );
    metadata.insert(
        "class_names".to_string(),
        serde_json::to_string(class_names)?,
    );
    metadata.insert("format".to_string(), "jersey_detector".to_string());

    safetensors::serialize(views, Some(metadata)).map_err(ExportError::Serialize)
}

pub fn write_safetensors(
    path: &Path,
    tensors: &[NamedTensor],
    architecture: &ArchitectureSpec,
    class_names: &[String],
) -> Result<u64, ExportError> {
    let bytes = to_safetensors(tensors, architecture, class_names)?;
    fs::write(path, &bytes).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{DetectorSpec, HeadKind};

    fn architecture() -> ArchitectureSpec {
        ArchitectureSpec {
            head: HeadKind::CustomHead,
            spec: DetectorSpec::new(32, 2, 4),
        }
    }

    #[test]
    fn shape_mismatch_names_the_tensor() {
        let bad = NamedTensor {
            name: "head.fc.weight".into(),
            shape: vec![3, 3],
            values: vec![0.0; 4],
        };
        let err = to_safetensors(&[bad], &architecture(), &["7".into()]).unwrap_err();
        assert!(matches!(&err, ExportError::Tensor { name, .. } if name == "head.fc.weight"));
    }

    #[test]
    fn unwritable_target_is_an_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing_dir/model.safetensors");
        let ok = NamedTensor {
            name: "w".into(),
            shape: vec![2],
            values: vec![1.0, 2.0],
        };
        let err = write_safetensors(&path, &[ok], &architecture(), &["7".into()]).unwrap_err();
        assert!(matches!(err, ExportError::Io { path: p, .. } if p == path));
    }
}
