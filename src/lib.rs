//! Sliding-window spectra of ultrasound RF volumes.
//!
//! ```text
//!   .nrrd / .json / .parquet
//!        │  data::loader
//!        ▼
//!   SignalVolume ──► SliceOrchestrator ──► SpectralVolume ──► select_bins
//!                                                                │
//!                                                                ▼
//!                                             DatasetPersister: .zarr + .nrrd
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod orchestrate;
pub mod persist;
pub mod spectral;

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::info;

pub use config::PipelineConfig;
pub use data::model::{SignalVolume, SpectralVolume};
pub use error::{PipelineError, Result};
pub use orchestrate::SliceOrchestrator;
pub use persist::{Artifact, CancelFlag, DatasetPersister};

/// Spectra of `signal` under `config`, with the bin selection applied.
pub fn compute(signal: &SignalVolume, config: &PipelineConfig) -> Result<SpectralVolume> {
    config.validate()?;
    let volume = SliceOrchestrator::new(config.spectral_params(), config.parallel)?.run(signal)?;
    match &config.bins {
        Some(selection) => data::select::select_bins(volume, selection),
        None => Ok(volume),
    }
}

/// Load `input`, compute its spectra and write them next to `output`
/// (base path, extensions are added per artifact). Returns the written paths.
pub fn run(
    input: &Path,
    output: &Path,
    config: &PipelineConfig,
    cancel: &CancelFlag,
) -> anyhow::Result<Vec<PathBuf>> {
    config.validate().context("invalid configuration")?;

    let signal = data::loader::load_file(input)
        .with_context(|| format!("loading {}", input.display()))?;
    info!("input shape {:?} from {}", signal.shape(), input.display());

    let volume = compute(&signal, config).context("computing spectra")?;

    let written = DatasetPersister::new(config.artifacts())
        .with_cancel(cancel.clone())
        .persist(&volume, output)
        .with_context(|| format!("writing {}", output.display()))?;
    Ok(written)
}
