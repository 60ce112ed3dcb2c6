use std::ops::Range;

use ndarray::Array2;

use super::{num_positions, SpectralParams};

// ---------------------------------------------------------------------------
// SupportWindow – the samples feeding one analysis position
// ---------------------------------------------------------------------------

/// Contiguous run of transform-axis samples, over one or more adjacent lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupportWindow {
    /// First transform-axis sample.
    pub start: usize,
    /// Number of transform-axis samples (`W`).
    pub width: usize,
    /// First lateral line (inclusive).
    pub first_line: usize,
    /// Last lateral line (exclusive).
    pub end_line: usize,
}

impl SupportWindow {
    pub fn samples(&self) -> Range<usize> {
        self.start..self.start + self.width
    }

    pub fn lines(&self) -> Range<usize> {
        self.first_line..self.end_line
    }

    /// Transform-axis sample the window is centred on.
    pub fn centre(&self) -> usize {
        self.start + self.width / 2
    }
}

// ---------------------------------------------------------------------------
// SupportWindowMap – one window per (position, line)
// ---------------------------------------------------------------------------

/// Support windows for every valid analysis position of a 2D frame.
///
/// Indexed `[position, line]`. The position axis is truncated to the windows
/// that fit entirely inside the frame; it is empty when the frame is shorter
/// than one window.
#[derive(Debug, Clone)]
pub struct SupportWindowMap {
    windows: Array2<SupportWindow>,
    extent: [usize; 2],
    fft_size: usize,
    step: usize,
}

impl SupportWindowMap {
    pub fn num_positions(&self) -> usize {
        self.windows.nrows()
    }

    pub fn num_lines(&self) -> usize {
        self.windows.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Extent `[x, y]` of the frame the map was built for.
    pub fn extent(&self) -> [usize; 2] {
        self.extent
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn get(&self, position: usize, line: usize) -> Option<&SupportWindow> {
        self.windows.get((position, line))
    }

    pub fn windows(&self) -> &Array2<SupportWindow> {
        &self.windows
    }
}

// ---------------------------------------------------------------------------
// SupportWindowBuilder
// ---------------------------------------------------------------------------

/// Lays out analysis windows along the transform axis (axis 0).
///
/// Windows start every `step` samples from sample 0. A window that would run
/// past the end of the frame is dropped, never padded or wrapped.
#[derive(Debug, Clone, Copy)]
pub struct SupportWindowBuilder {
    fft_size: usize,
    step: usize,
    side_lines: usize,
}

impl SupportWindowBuilder {
    pub fn new(params: &SpectralParams) -> Self {
        Self {
            fft_size: params.fft_size,
            step: params.step,
            side_lines: params.side_lines,
        }
    }

    /// Build the map for a frame of extent `[x, y]`.
    pub fn build(&self, extent: [usize; 2]) -> SupportWindowMap {
        let [len, lines] = extent;
        let positions = num_positions(len, self.fft_size, self.step);

        let windows = Array2::from_shape_fn((positions, lines), |(p, line)| SupportWindow {
            start: p * self.step,
            width: self.fft_size,
            first_line: line.saturating_sub(self.side_lines),
            end_line: (line + self.side_lines + 1).min(lines),
        });

        SupportWindowMap {
            windows,
            extent,
            fft_size: self.fft_size,
            step: self.step,
        }
    }
}
