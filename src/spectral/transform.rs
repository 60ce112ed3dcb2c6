use std::sync::Arc;

use ndarray::{s, Array3, ArrayView2};
use realfft::{num_complex::Complex, RealFftPlanner, RealToComplex};

use super::{SpectralParams, SpectrumScale, SupportWindowMap};
use crate::error::{PipelineError, Result};

/// Windowed real-input FFT applied to every support window of a frame.
///
/// Holds its own FFT plan and buffers, so one transformer is used per worker.
/// Cloning is cheap: the plan is shared, the buffers are copied.
#[derive(Clone)]
pub struct SpectralTransformer {
    /// forward fft plan
    fft: Arc<dyn RealToComplex<f32>>,
    /// taper applied to each window before the fft
    taper: Vec<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    /// accumulates the spectra of the lines covered by one window
    accumulator: Vec<f32>,
    scale: SpectrumScale,
}

impl SpectralTransformer {
    pub fn new(params: &SpectralParams) -> Result<Self> {
        params.validate()?;

        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(params.fft_size);
        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();

        Ok(Self {
            taper: params.window.build(params.fft_size),
            accumulator: vec![0.0; spectrum.len()],
            fft,
            input,
            spectrum,
            scratch,
            scale: params.scale,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.taper.len()
    }

    /// Length of the vector axis of the output.
    pub fn num_bins(&self) -> usize {
        self.spectrum.len()
    }

    /// Compute the spectra of every window in `map`.
    ///
    /// `frame` is indexed `[x, y]`; the output is indexed
    /// `[position, y, bin]`. An empty map produces an output with a
    /// zero-length position axis.
    pub fn transform(&mut self, frame: ArrayView2<'_, f32>, map: &SupportWindowMap) -> Result<Array3<f32>> {
        let (len, lines) = frame.dim();
        if map.extent() != [len, lines] {
            return Err(PipelineError::invalid(
                "support window map",
                format!("built for extent {:?}, frame is [{len}, {lines}]", map.extent()),
            ));
        }
        if map.fft_size() != self.fft_size() {
            return Err(PipelineError::invalid(
                "support window map",
                format!(
                    "window width {} does not match transform size {}",
                    map.fft_size(),
                    self.fft_size()
                ),
            ));
        }

        let bins = self.num_bins();
        let mut output = Array3::<f32>::zeros((map.num_positions(), lines, bins));

        for ((p, line), window) in map.windows().indexed_iter() {
            self.accumulator.fill(0.0);

            for l in window.lines() {
                let samples = frame.slice(s![window.samples(), l]);
                for ((dst, &src), &w) in self.input.iter_mut().zip(samples.iter()).zip(&self.taper) {
                    *dst = src * w;
                }
                self.forward()?;

                for (acc, c) in self.accumulator.iter_mut().zip(&self.spectrum) {
                    *acc += match self.scale {
                        SpectrumScale::Power => c.norm_sqr(),
                        SpectrumScale::Magnitude => c.norm(),
                    };
                }
            }

            let count = window.lines().len().max(1) as f32;
            output
                .slice_mut(s![p, line, ..])
                .iter_mut()
                .zip(&self.accumulator)
                .for_each(|(dst, &acc)| *dst = acc / count);
        }

        Ok(output)
    }

    /// Spectrum of a single window of `fft_size` samples.
    pub fn spectrum_of(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        if samples.len() != self.fft_size() {
            return Err(PipelineError::invalid(
                "samples",
                format!("expected {} samples, got {}", self.fft_size(), samples.len()),
            ));
        }
        for ((dst, &src), &w) in self.input.iter_mut().zip(samples).zip(&self.taper) {
            *dst = src * w;
        }
        self.forward()?;

        Ok(self
            .spectrum
            .iter()
            .map(|c| match self.scale {
                SpectrumScale::Power => c.norm_sqr(),
                SpectrumScale::Magnitude => c.norm(),
            })
            .collect())
    }

    fn forward(&mut self) -> Result<()> {
        self.fft
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .map_err(|e| PipelineError::invalid("fft", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::{SupportWindowBuilder, WindowType};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use std::f32::consts::TAU;

    fn params(fft_size: usize, step: usize) -> SpectralParams {
        SpectralParams {
            fft_size,
            step,
            side_lines: 0,
            ..Default::default()
        }
    }

    fn argmax(values: &[f32]) -> usize {
        values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap()
    }

    #[test]
    fn sinusoid_peaks_at_its_bin() {
        let mut transformer = SpectralTransformer::new(&params(32, 4)).unwrap();
        for bin in [1usize, 4, 7, 12] {
            let samples: Vec<f32> = (0..32)
                .map(|n| (TAU * bin as f32 * n as f32 / 32.0).sin())
                .collect();
            let spectrum = transformer.spectrum_of(&samples).unwrap();
            assert_eq!(spectrum.len(), 17);
            assert_eq!(argmax(&spectrum), bin);
        }
    }

    #[test]
    fn constant_signal_is_all_dc() {
        let mut transformer = SpectralTransformer::new(&SpectralParams {
            fft_size: 16,
            window: WindowType::Rectangular,
            scale: SpectrumScale::Magnitude,
            ..Default::default()
        })
        .unwrap();
        let spectrum = transformer.spectrum_of(&[2.0; 16]).unwrap();
        assert_abs_diff_eq!(spectrum[0], 32.0, epsilon = 1e-4);
        for &v in &spectrum[1..] {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn frame_output_shape() {
        let p = params(32, 4);
        let frame = Array2::<f32>::from_shape_fn((64, 8), |(x, y)| ((x * 7 + y) % 5) as f32);
        let map = SupportWindowBuilder::new(&p).build([64, 8]);
        let out = SpectralTransformer::new(&p)
            .unwrap()
            .transform(frame.view(), &map)
            .unwrap();
        assert_eq!(out.dim(), (9, 8, 17));
    }

    #[test]
    fn frame_windows_match_single_window_spectra() {
        let p = params(16, 8);
        let frame = Array2::<f32>::from_shape_fn((40, 3), |(x, y)| (x as f32 * 0.3 + y as f32).sin());
        let map = SupportWindowBuilder::new(&p).build([40, 3]);
        let mut transformer = SpectralTransformer::new(&p).unwrap();
        let out = transformer.transform(frame.view(), &map).unwrap();
        assert_eq!(out.dim(), (4, 3, 9));

        let window: Vec<f32> = frame.slice(s![16..32, 2]).to_vec();
        let expected = transformer.spectrum_of(&window).unwrap();
        for (b, &e) in expected.iter().enumerate() {
            assert_abs_diff_eq!(out[[2, 2, b]], e, epsilon = 1e-4);
        }
    }

    #[test]
    fn side_lines_average_neighbours() {
        let p = SpectralParams {
            fft_size: 8,
            step: 8,
            side_lines: 1,
            ..Default::default()
        };
        let frame = Array2::<f32>::from_shape_fn((8, 3), |(x, y)| (x as f32 + 1.0) * (y as f32 + 1.0));
        let map = SupportWindowBuilder::new(&p).build([8, 3]);
        let mut transformer = SpectralTransformer::new(&p).unwrap();
        let out = transformer.transform(frame.view(), &map).unwrap();

        let mut expected = vec![0.0f32; 5];
        for y in 0..3 {
            let spectrum = transformer.spectrum_of(&frame.column(y).to_vec()).unwrap();
            for (acc, v) in expected.iter_mut().zip(spectrum) {
                *acc += v / 3.0;
            }
        }
        for b in 0..5 {
            assert_abs_diff_eq!(out[[0, 1, b]], expected[b], epsilon = 1e-3);
        }
    }

    #[test]
    fn short_frame_gives_empty_positions() {
        let p = params(32, 4);
        let frame = Array2::<f32>::zeros((20, 4));
        let map = SupportWindowBuilder::new(&p).build([20, 4]);
        let out = SpectralTransformer::new(&p)
            .unwrap()
            .transform(frame.view(), &map)
            .unwrap();
        assert_eq!(out.dim(), (0, 4, 17));
    }

    #[test]
    fn mismatched_map_is_rejected() {
        let p = params(8, 2);
        let frame = Array2::<f32>::zeros((16, 2));
        let map = SupportWindowBuilder::new(&p).build([16, 3]);
        assert!(SpectralTransformer::new(&p)
            .unwrap()
            .transform(frame.view(), &map)
            .is_err());
    }
}
