//! Checkpoint naming and writing.

use burn::tensor::backend::Backend;
use models::{export_backbone, JerseyDetector};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::run::FailureCause;

pub const LAST_CHECKPOINT: &str = "last.bin";
/// Backbone-only record of the final model, usable as `--backbone-weights`.
pub const BACKBONE_CHECKPOINT: &str = "backbone.bin";

pub fn epoch_checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("epoch_{epoch:03}.bin"))
}

pub fn last_checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(LAST_CHECKPOINT)
}

pub fn backbone_checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(BACKBONE_CHECKPOINT)
}

/// Periodic checkpoints fall on every `save_period`-th epoch (1-based).
pub fn is_checkpoint_epoch(epoch: usize, save_period: usize) -> bool {
    save_period > 0 && epoch % save_period == 0
}

/// Write the record plus its architecture sidecar.
pub fn write_checkpoint<B: Backend>(
    detector: &JerseyDetector<B>,
    path: &Path,
) -> Result<PathBuf, FailureCause> {
    detector
        .save_checkpoint(path)
        .map_err(|e| FailureCause::Checkpoint(e.to_string()))?;
    info!(path = %path.display(), "saved checkpoint");
    Ok(path.to_path_buf())
}

pub fn write_backbone<B: Backend>(
    detector: &JerseyDetector<B>,
    path: &Path,
) -> Result<(), FailureCause> {
    export_backbone(detector, path).map_err(|e| FailureCause::Checkpoint(e.to_string()))?;
    info!(path = %path.display(), "saved backbone weights");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_zero_padded() {
        let dir = Path::new("runs/x/checkpoints");
        assert_eq!(
            epoch_checkpoint_path(dir, 7),
            Path::new("runs/x/checkpoints/epoch_007.bin")
        );
        assert_eq!(
            last_checkpoint_path(dir),
            Path::new("runs/x/checkpoints/last.bin")
        );
    }

    #[test]
    fn period_selects_multiples() {
        let picked: Vec<usize> = (1..=25).filter(|&e| is_checkpoint_epoch(e, 10)).collect();
        assert_eq!(picked, vec![10, 20]);
        assert!(!is_checkpoint_epoch(3, 0));
    }
}
