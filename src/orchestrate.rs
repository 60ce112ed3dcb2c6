use log::{debug, info};
use ndarray::{Array4, ArrayView2};
use rayon::prelude::*;

use crate::data::model::{
    Geometry2, Signal2, Signal3, SignalVolume, SpectralSlice, SpectralStack, SpectralVolume,
};
use crate::error::{PipelineError, Result};
use crate::spectral::{SpectralParams, SpectralTransformer, SupportWindowBuilder};

// ---------------------------------------------------------------------------
// Output geometry
// ---------------------------------------------------------------------------

/// Geometry of the spectra of a frame with geometry `input`.
///
/// Analysis positions are `step` samples apart and sit on the centre sample
/// of their window, so the transform-axis spacing is scaled by `step` and the
/// origin moves `W/2` samples along the transform-axis direction. The other
/// axis is unchanged.
pub fn spectral_geometry(input: &Geometry2, params: &SpectralParams) -> Geometry2 {
    let shift = input.spacing[0] * (params.fft_size / 2) as f64;
    let mut out = *input;
    out.spacing[0] = input.spacing[0] * params.step as f64;
    for (row, origin) in out.origin.iter_mut().enumerate() {
        *origin += input.direction[row][0] * shift;
    }
    out
}

// ---------------------------------------------------------------------------
// SliceOrchestrator
// ---------------------------------------------------------------------------

/// Runs the 2D spectral path on a frame, or on every frame of a stack.
///
/// Frames of a stack are independent; with `parallel` set they are
/// transformed on the rayon pool, each worker writing its own depth layer of a
/// pre-sized buffer. Layer order always follows depth order.
#[derive(Debug, Clone)]
pub struct SliceOrchestrator {
    params: SpectralParams,
    parallel: bool,
}

impl SliceOrchestrator {
    pub fn new(params: SpectralParams, parallel: bool) -> Result<Self> {
        params.validate()?;
        Ok(Self { params, parallel })
    }

    pub fn params(&self) -> &SpectralParams {
        &self.params
    }

    pub fn run(&self, signal: &SignalVolume) -> Result<SpectralVolume> {
        info!(
            "computing spectra of {:?} signal (W={}, S={}, side lines={})",
            signal.shape(),
            self.params.fft_size,
            self.params.step,
            self.params.side_lines
        );

        let volume = match signal {
            SignalVolume::Plane(plane) => SpectralVolume::Plane(self.run_plane(plane)?),
            SignalVolume::Volume(stack) => SpectralVolume::Volume(self.run_stack(stack)?),
        };

        info!("spectral volume shape {:?}", volume.shape());
        Ok(volume)
    }

    fn bins(&self) -> Vec<i64> {
        (0..self.params.num_bins() as i64).collect()
    }

    fn run_plane(&self, plane: &Signal2) -> Result<SpectralSlice> {
        let mut transformer = SpectralTransformer::new(&self.params)?;
        let map = SupportWindowBuilder::new(&self.params).build(dim2(plane.samples.view()));
        let data = transformer.transform(plane.samples.view(), &map)?;

        Ok(SpectralSlice {
            data,
            geometry: spectral_geometry(&plane.geometry, &self.params),
            bins: self.bins(),
            params: self.params,
        })
    }

    fn run_stack(&self, stack: &Signal3) -> Result<SpectralStack> {
        let (nx, ny, depth) = stack.samples.dim();
        let positions = crate::spectral::num_positions(nx, self.params.fft_size, self.params.step);
        let bins = self.params.num_bins();
        let layer_len = positions * ny * bins;

        // storage order: [z][y][x][c]
        let mut buffer = vec![0.0f32; layer_len * depth];
        let mut transformer = SpectralTransformer::new(&self.params)?;

        let layers: Vec<usize> = if layer_len == 0 {
            (0..depth)
                .map(|k| self.fill_layer(stack, k, &mut [], &mut transformer))
                .collect::<Result<_>>()?
        } else if self.parallel {
            buffer
                .par_chunks_mut(layer_len)
                .enumerate()
                .map_init(
                    || transformer.clone(),
                    |worker, (k, layer)| self.fill_layer(stack, k, layer, worker),
                )
                .collect::<Result<_>>()?
        } else {
            buffer
                .chunks_mut(layer_len)
                .enumerate()
                .map(|(k, layer)| self.fill_layer(stack, k, layer, &mut transformer))
                .collect::<Result<_>>()?
        };

        let in_order = layers.iter().enumerate().all(|(i, &k)| i == k);
        if layers.len() != depth || !in_order {
            return Err(PipelineError::SliceCountMismatch {
                expected: depth,
                actual: layers.len(),
            });
        }

        let data = Array4::from_shape_vec((depth, ny, positions, bins), buffer)
            .map_err(|e| PipelineError::invalid("spectral buffer", e.to_string()))?
            .permuted_axes([2, 1, 0, 3]);

        let geometry = &stack.geometry;
        let plane = spectral_geometry(&geometry.in_plane(), &self.params);

        Ok(SpectralStack {
            data,
            geometry: plane.extend(geometry.spacing[2], geometry.origin[2]),
            z: geometry.axis_coordinates(2, depth),
            bins: self.bins(),
            params: self.params,
        })
    }

    /// Transform frame `k` into `layer` (storage order `[y][x][c]`).
    fn fill_layer(
        &self,
        stack: &Signal3,
        k: usize,
        layer: &mut [f32],
        transformer: &mut SpectralTransformer,
    ) -> Result<usize> {
        let frame = stack.slice(k);
        let map = SupportWindowBuilder::new(&self.params).build(dim2(frame));
        let spectra = transformer.transform(frame, &map)?;

        if spectra.len() != layer.len() {
            return Err(PipelineError::invalid(
                "spectral layer",
                format!("slice {k} produced {} values, layer holds {}", spectra.len(), layer.len()),
            ));
        }
        for (dst, &src) in layer.iter_mut().zip(spectra.view().permuted_axes([1, 0, 2]).iter()) {
            *dst = src;
        }

        debug!("slice {k} done");
        Ok(k)
    }
}

fn dim2(frame: ArrayView2<'_, f32>) -> [usize; 2] {
    let (x, y) = frame.dim();
    [x, y]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::Geometry3;
    use ndarray::{Array2, Array3, Axis};

    fn params() -> SpectralParams {
        SpectralParams {
            fft_size: 32,
            step: 4,
            ..Default::default()
        }
    }

    fn stack(depth: usize) -> Signal3 {
        Signal3 {
            samples: Array3::from_shape_fn((64, 8, depth), |(x, y, z)| {
                ((x as f32) * 0.4 + y as f32 + 3.0 * z as f32).sin()
            }),
            geometry: Geometry3 {
                spacing: [0.05, 0.3, 0.7],
                origin: [1.0, -2.0, 4.5],
                direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            },
        }
    }

    #[test]
    fn default_run_averages_eleven_lines_clipped_at_edges() {
        let defaults = SpectralParams::default();
        assert_eq!(defaults.side_lines, 5);

        let frame = Array2::from_shape_fn((64, 16), |(x, y)| {
            (1.0 + y as f32) * ((x as f32) * (0.3 + 0.05 * y as f32)).sin()
        });
        let map = SupportWindowBuilder::new(&defaults).build([64, 16]);
        assert_eq!(map.get(0, 8).map(|w| w.lines()), Some(3..14));
        assert_eq!(map.get(0, 0).map(|w| w.lines()), Some(0..6));
        assert_eq!(map.get(0, 15).map(|w| w.lines()), Some(10..16));

        let signal = SignalVolume::Plane(Signal2 {
            samples: frame.clone(),
            geometry: Geometry2::default(),
        });
        let SpectralVolume::Plane(result) = SliceOrchestrator::new(defaults, false)
            .unwrap()
            .run(&signal)
            .unwrap()
        else {
            panic!("expected a plane");
        };

        let mut transformer = SpectralTransformer::new(&defaults).unwrap();
        let position = 2;
        let start = position * defaults.step;
        for (line, lines) in [(8, 3..14), (0, 0..6), (15, 10..16)] {
            let count = lines.len() as f32;
            let mut expected = vec![0.0f32; defaults.num_bins()];
            for y in lines {
                let window = frame.slice(ndarray::s![start..start + defaults.fft_size, y]).to_vec();
                for (acc, v) in expected.iter_mut().zip(transformer.spectrum_of(&window).unwrap()) {
                    *acc += v / count;
                }
            }
            for (b, &e) in expected.iter().enumerate() {
                approx::assert_relative_eq!(
                    result.data[[position, line, b]],
                    e,
                    epsilon = 1e-3,
                    max_relative = 1e-3
                );
            }
        }
    }

    #[test]
    fn plane_scenario_shape() {
        let signal = SignalVolume::Plane(Signal2 {
            samples: Array2::from_shape_fn((64, 8), |(x, y)| (x * y) as f32),
            geometry: Geometry2::default(),
        });
        let out = SliceOrchestrator::new(params(), false).unwrap().run(&signal).unwrap();
        assert_eq!(out.shape(), vec![9, 8, 17]);
    }

    #[test]
    fn stack_scenario_shape_and_depth_coordinates() {
        let signal = SignalVolume::Volume(stack(5));
        let out = SliceOrchestrator::new(params(), true).unwrap().run(&signal).unwrap();
        assert_eq!(out.shape(), vec![9, 8, 5, 17]);
        let expected: Vec<f64> = (0..5).map(|k| 4.5 + k as f64 * 0.7).collect();
        assert_eq!(out.coordinates("z").unwrap(), expected);
    }

    #[test]
    fn depth_coordinates_for_various_depths() {
        for depth in [1usize, 2, 16] {
            let out = SliceOrchestrator::new(params(), true)
                .unwrap()
                .run(&SignalVolume::Volume(stack(depth)))
                .unwrap();
            let SpectralVolume::Volume(result) = out else {
                panic!("expected a volume");
            };
            assert_eq!(result.data.len_of(Axis(2)), depth);
            assert_eq!(result.z.len(), depth);
            for (k, &z) in result.z.iter().enumerate() {
                assert_eq!(z, 4.5 + k as f64 * 0.7);
            }
            assert_eq!(result.geometry.origin[2], 4.5);
            assert_eq!(result.geometry.spacing[2], 0.7);
        }
    }

    #[test]
    fn each_layer_matches_the_plane_path() {
        let signal = stack(3);
        let orchestrator = SliceOrchestrator::new(params(), true).unwrap();
        let SpectralVolume::Volume(result) = orchestrator.run(&SignalVolume::Volume(signal.clone())).unwrap() else {
            panic!("expected a volume");
        };

        for k in 0..3 {
            let plane = SignalVolume::Plane(Signal2 {
                samples: signal.slice(k).to_owned(),
                geometry: signal.geometry.in_plane(),
            });
            let SpectralVolume::Plane(expected) = orchestrator.run(&plane).unwrap() else {
                panic!("expected a plane");
            };
            assert_eq!(result.data.index_axis(Axis(2), k), expected.data);
            assert_eq!(result.geometry.in_plane(), expected.geometry);
        }
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let signal = SignalVolume::Volume(stack(4));
        let a = SliceOrchestrator::new(params(), true).unwrap().run(&signal).unwrap();
        let b = SliceOrchestrator::new(params(), false).unwrap().run(&signal).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn orientation_is_extended_with_identity_depth() {
        let mut signal = stack(2);
        signal.geometry.direction = [[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        let SpectralVolume::Volume(result) = SliceOrchestrator::new(params(), false)
            .unwrap()
            .run(&SignalVolume::Volume(signal))
            .unwrap()
        else {
            panic!("expected a volume");
        };
        assert_eq!(
            result.geometry.direction,
            [[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]
        );
    }

    #[test]
    fn output_geometry_follows_window_centres() {
        let input = Geometry2 {
            spacing: [0.5, 2.0],
            origin: [10.0, 20.0],
            direction: [[1.0, 0.0], [0.0, 1.0]],
        };
        let out = spectral_geometry(&input, &params());
        assert_eq!(out.spacing, [2.0, 2.0]);
        assert_eq!(out.origin, [18.0, 20.0]);
        assert_eq!(out.direction, input.direction);
    }

    #[test]
    fn short_stack_yields_empty_positions() {
        let signal = SignalVolume::Volume(Signal3 {
            samples: Array3::zeros((16, 4, 3)),
            geometry: Geometry3::default(),
        });
        let out = SliceOrchestrator::new(params(), true).unwrap().run(&signal).unwrap();
        assert_eq!(out.shape(), vec![0, 4, 3, 17]);
        assert_eq!(out.coordinates("z").unwrap(), vec![0.0, 1.0, 2.0]);
    }
}
