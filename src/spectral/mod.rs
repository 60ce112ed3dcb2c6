/// Sliding-window spectral analysis of one 2D RF frame.
///
/// ```text
///   RF frame [x, y]
///        │
///        ▼
///   ┌──────────┐
///   │ support  │  window starts every `step` samples along x
///   └──────────┘
///        │  SupportWindowMap [position, y]
///        ▼
///   ┌───────────┐
///   │ transform │  taper → real FFT → power/magnitude, W/2+1 bins
///   └───────────┘
///        │
///        ▼
///   SpectralSlice [position, y, c]
/// ```

pub mod support;
pub mod transform;
pub mod window;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub use support::{SupportWindow, SupportWindowBuilder, SupportWindowMap};
pub use transform::SpectralTransformer;
pub use window::WindowType;

// ---------------------------------------------------------------------------
// SpectrumScale
// ---------------------------------------------------------------------------

/// What each frequency-bin component holds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpectrumScale {
    /// `|X|²`
    #[default]
    Power,
    /// `|X|`
    Magnitude,
}

impl SpectrumScale {
    pub fn name(self) -> &'static str {
        match self {
            SpectrumScale::Power => "power",
            SpectrumScale::Magnitude => "magnitude",
        }
    }
}

impl fmt::Display for SpectrumScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SpectrumScale {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "power" => Ok(SpectrumScale::Power),
            "magnitude" | "mag" => Ok(SpectrumScale::Magnitude),
            other => Err(format!("unknown spectrum scale '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// SpectralParams
// ---------------------------------------------------------------------------

/// Parameters shared by the support-window and transform stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralParams {
    /// Samples per window along the transform axis (`W`).
    pub fft_size: usize,
    /// Stride between consecutive windows (`S`).
    pub step: usize,
    /// Neighbouring lines averaged on each side of the centre line.
    pub side_lines: usize,
    pub window: WindowType,
    pub scale: SpectrumScale,
}

impl Default for SpectralParams {
    fn default() -> Self {
        Self {
            fft_size: 32,
            step: 4,
            side_lines: 5,
            window: WindowType::Hann,
            scale: SpectrumScale::Power,
        }
    }
}

impl SpectralParams {
    /// Bins kept from the real-input transform (non-redundant half).
    pub fn num_bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.fft_size < 2 {
            return Err(PipelineError::invalid(
                "fft_size",
                format!("must be at least 2, got {}", self.fft_size),
            ));
        }
        if self.step == 0 {
            return Err(PipelineError::invalid("step", "must be positive"));
        }
        Ok(())
    }
}

/// Number of valid analysis positions along a transform axis of `len` samples.
///
/// `floor((len - W) / S) + 1` when `len >= W`, otherwise 0.
pub fn num_positions(len: usize, fft_size: usize, step: usize) -> usize {
    if len < fft_size || step == 0 {
        0
    } else {
        (len - fft_size) / step + 1
    }
}
