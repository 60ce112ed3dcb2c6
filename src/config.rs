use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::select::BinSelection;
use crate::error::{IoContext, PipelineError, Result};
use crate::persist::zarr::ZSTD_LEVELS;
use crate::persist::Artifact;
use crate::spectral::{SpectralParams, SpectrumScale, WindowType};

// ---------------------------------------------------------------------------
// PipelineConfig – everything a run can be tuned with
// ---------------------------------------------------------------------------

/// Run configuration, read from a JSON file and/or overridden from the CLI.
///
/// ```json
/// { "fft_size": 64, "step": 8, "window": "hamming", "bins": { "start": 2, "end": 20 } }
/// ```
///
/// Missing keys take their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub fft_size: usize,
    pub step: usize,
    pub side_lines: usize,
    pub window: WindowType,
    pub scale: SpectrumScale,
    pub bins: Option<BinSelection>,
    pub parallel: bool,
    pub compression_level: i32,
    pub write_zarr: bool,
    pub write_nrrd: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let params = SpectralParams::default();
        Self {
            fft_size: params.fft_size,
            step: params.step,
            side_lines: params.side_lines,
            window: params.window,
            scale: params.scale,
            bins: None,
            parallel: true,
            compression_level: 3,
            write_zarr: true,
            write_nrrd: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).at(path)?;
        serde_json::from_str(&text).map_err(|e| PipelineError::format(path, e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.spectral_params().validate()?;
        if !ZSTD_LEVELS.contains(&self.compression_level) {
            return Err(PipelineError::invalid(
                "compression_level",
                format!(
                    "{} is outside {}..={}",
                    self.compression_level,
                    ZSTD_LEVELS.start(),
                    ZSTD_LEVELS.end()
                ),
            ));
        }
        if let Some(bins) = &self.bins {
            if bins.is_empty() || bins.end > self.spectral_params().num_bins() {
                return Err(PipelineError::invalid(
                    "bins",
                    format!("selection {bins} is empty or outside 0..{}", self.spectral_params().num_bins()),
                ));
            }
        }
        Ok(())
    }

    pub fn spectral_params(&self) -> SpectralParams {
        SpectralParams {
            fft_size: self.fft_size,
            step: self.step,
            side_lines: self.side_lines,
            window: self.window,
            scale: self.scale,
        }
    }

    /// Enabled outputs, Zarr first.
    pub fn artifacts(&self) -> Vec<Artifact> {
        let mut artifacts = Vec::with_capacity(2);
        if self.write_zarr {
            artifacts.push(Artifact::Zarr {
                level: self.compression_level,
            });
        }
        if self.write_nrrd {
            artifacts.push(Artifact::Nrrd { gzip: true });
        }
        artifacts
    }
}
