use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Raw manifest document as written next to the dataset (`dataset.yaml`).
///
/// Every key is optional at the serde level so a missing key is reported by
/// name instead of as an opaque parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestFile {
    pub train: Option<String>,
    pub val: Option<String>,
    pub nc: Option<usize>,
    pub names: Option<Vec<String>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("missing required field `{0}`")]
    MissingKey(&'static str),
    #[error("nc is {nc} but names lists {names} classes")]
    ClassCountMismatch { nc: usize, names: usize },
    #[error("malformed manifest: {0}")]
    Malformed(String),
}

/// Validated manifest with paths resolved against the manifest directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub train_path: PathBuf,
    pub val_path: PathBuf,
    pub num_classes: usize,
    pub class_names: Vec<String>,
}

impl ManifestFile {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ManifestError> {
        // An empty document deserializes to unit; treat it as an empty mapping.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| ManifestError::Malformed(e.to_string()))
    }

    /// Check required keys and class-count consistency, resolving relative
    /// paths against `base_dir`.
    pub fn into_manifest(self, base_dir: &Path) -> Result<DatasetManifest, ManifestError> {
        let train = self.train.ok_or(ManifestError::MissingKey("train"))?;
        let val = self.val.ok_or(ManifestError::MissingKey("val"))?;
        let nc = self.nc.ok_or(ManifestError::MissingKey("nc"))?;
        let names = self.names.ok_or(ManifestError::MissingKey("names"))?;
        if nc != names.len() {
            return Err(ManifestError::ClassCountMismatch {
                nc,
                names: names.len(),
            });
        }
        Ok(DatasetManifest {
            train_path: resolve(base_dir, &train),
            val_path: resolve(base_dir, &val),
            num_classes: nc,
            class_names: names,
        })
    }
}

impl DatasetManifest {
    pub fn class_name(&self, class_id: u32) -> Option<&str> {
        self.class_names.get(class_id as usize).map(String::as_str)
    }
}

fn resolve(base_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
