//! Startup checks: everything the run needs must already be present.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use training::validate_backend_choice;

use crate::cli::TrainJerseyArgs;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{0}")]
    Device(String),
    #[error("{what} not found: {path}")]
    MissingInput { what: &'static str, path: PathBuf },
    #[error("output directory {path} is not writable: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn require_file(what: &'static str, path: Option<&Path>) -> Result<(), CapabilityError> {
    match path {
        Some(p) if !p.is_file() => Err(CapabilityError::MissingInput {
            what,
            path: p.to_path_buf(),
        }),
        _ => Ok(()),
    }
}

fn probe_writable(dir: &Path) -> Result<(), CapabilityError> {
    let unwritable = |source| CapabilityError::Unwritable {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(unwritable)?;
    let probe = dir.join(".write_probe");
    fs::write(&probe, b"ok").map_err(unwritable)?;
    fs::remove_file(&probe).map_err(unwritable)
}

/// Fail fast before any data is read or compute allocated. Nothing is
/// installed or downloaded.
pub fn capability_check(args: &TrainJerseyArgs) -> Result<(), CapabilityError> {
    validate_backend_choice(args.device).map_err(|e| CapabilityError::Device(e.to_string()))?;
    require_file("pretrained checkpoint", args.pretrained.as_deref())?;
    require_file("backbone weights", args.backbone_weights.as_deref())?;
    require_file("config file", args.config.as_deref())?;
    probe_writable(&args.run_dir())?;
    tracing::debug!(
        device = %args.device,
        run_dir = %args.run_dir().display(),
        "capability check passed"
    );
    Ok(())
}

/// Numeric backend this binary was built with.
pub fn compiled_backend() -> &'static str {
    if cfg!(feature = "backend-wgpu") {
        "wgpu"
    } else {
        "ndarray"
    }
}
