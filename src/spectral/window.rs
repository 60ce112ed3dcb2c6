//! Taper windows applied to each support window before the FFT.

use std::f32::consts::TAU;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    /// No taper; every sample weighted 1.0.
    Rectangular,
    #[default]
    Hann,
    Hamming,
    Blackman,
}

impl WindowType {
    /// Build a periodic window of `size` samples.
    pub fn build(self, size: usize) -> Vec<f32> {
        let mut vec = vec![0.0; size];
        self.fill(&mut vec);
        vec
    }

    /// In-place variant of [`build()`](Self::build).
    pub fn fill(self, slice: &mut [f32]) {
        match self {
            WindowType::Rectangular => slice.fill(1.0),
            WindowType::Hann => cosine_sum(slice, &[0.5, 0.5]),
            WindowType::Hamming => cosine_sum(slice, &[0.54, 0.46]),
            WindowType::Blackman => cosine_sum(slice, &[0.42, 0.5, 0.08]),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WindowType::Rectangular => "rectangular",
            WindowType::Hann => "hann",
            WindowType::Hamming => "hamming",
            WindowType::Blackman => "blackman",
        }
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WindowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rectangular" | "rect" | "none" => Ok(WindowType::Rectangular),
            "hann" | "hanning" => Ok(WindowType::Hann),
            "hamming" => Ok(WindowType::Hamming),
            "blackman" => Ok(WindowType::Blackman),
            other => Err(format!("unknown window type '{other}'")),
        }
    }
}

/// Generalised cosine-sum window:
/// `w[n] = a0 - a1 cos(τn/N) + a2 cos(2τn/N) - ...`
///
/// Uses the periodic form (divides by `N`, not `N - 1`), which keeps the
/// window's bins aligned with the FFT bins.
fn cosine_sum(slice: &mut [f32], coeffs: &[f32]) {
    let size = slice.len() as f32;

    for (n, x) in slice.iter_mut().enumerate() {
        let mut sum = coeffs[0];

        for (i, coeff) in coeffs.iter().enumerate().skip(1) {
            let term = coeff * ((i as f32 * TAU) * (n as f32) / size).cos();
            if i % 2 == 1 {
                sum -= term;
            } else {
                sum += term;
            }
        }

        *x = sum;
    }
}
