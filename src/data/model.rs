use ndarray::{Array2, Array3, Array4, ArrayView2, Axis, ShapeBuilder};

use crate::error::{PipelineError, Result};
use crate::spectral::SpectralParams;

// ---------------------------------------------------------------------------
// Geometry – spacing, origin and orientation of an image grid
// ---------------------------------------------------------------------------

/// Physical placement of a `D`-dimensional sample grid.
///
/// `direction` is row-major; column `i` is the physical direction of axis `i`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry<const D: usize> {
    pub spacing: [f64; D],
    pub origin: [f64; D],
    pub direction: [[f64; D]; D],
}

pub type Geometry2 = Geometry<2>;
pub type Geometry3 = Geometry<3>;

impl<const D: usize> Default for Geometry<D> {
    fn default() -> Self {
        let mut direction = [[0.0; D]; D];
        for (i, row) in direction.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            spacing: [1.0; D],
            origin: [0.0; D],
            direction,
        }
    }
}

impl<const D: usize> Geometry<D> {
    /// Build from loosely typed parts, checking every length against `D`.
    pub fn from_parts(spacing: &[f64], origin: &[f64], direction: &[Vec<f64>]) -> Result<Self> {
        let mut geometry = Self::default();

        if spacing.len() != D {
            return Err(PipelineError::invalid(
                "spacing",
                format!("expected {D} values, got {}", spacing.len()),
            ));
        }
        if let Some(bad) = spacing.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(PipelineError::invalid("spacing", format!("must be positive, got {bad}")));
        }
        if origin.len() != D {
            return Err(PipelineError::invalid(
                "origin",
                format!("expected {D} values, got {}", origin.len()),
            ));
        }
        if direction.len() != D || direction.iter().any(|row| row.len() != D) {
            return Err(PipelineError::invalid(
                "direction",
                format!("expected a {D}x{D} matrix"),
            ));
        }

        geometry.spacing.copy_from_slice(spacing);
        geometry.origin.copy_from_slice(origin);
        for (dst, src) in geometry.direction.iter_mut().zip(direction) {
            dst.copy_from_slice(src);
        }
        Ok(geometry)
    }

    /// Physical coordinates along `axis` as used for labeled arrays:
    /// `origin[axis] + i * spacing[axis]`.
    pub fn axis_coordinates(&self, axis: usize, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| self.origin[axis] + i as f64 * self.spacing[axis])
            .collect()
    }

    pub fn direction_rows(&self) -> Vec<Vec<f64>> {
        self.direction.iter().map(|row| row.to_vec()).collect()
    }
}

impl Geometry2 {
    /// Append an untilted stacking axis: the 2x2 orientation is zero-padded
    /// to 3x3 with a 1.0 on the new diagonal entry.
    pub fn extend(&self, spacing_z: f64, origin_z: f64) -> Geometry3 {
        let d = &self.direction;
        Geometry3 {
            spacing: [self.spacing[0], self.spacing[1], spacing_z],
            origin: [self.origin[0], self.origin[1], origin_z],
            direction: [
                [d[0][0], d[0][1], 0.0],
                [d[1][0], d[1][1], 0.0],
                [0.0, 0.0, 1.0],
            ],
        }
    }
}

impl Geometry3 {
    /// Identity direction collapse: keep the in-plane axes exactly, drop depth.
    pub fn in_plane(&self) -> Geometry2 {
        let d = &self.direction;
        Geometry2 {
            spacing: [self.spacing[0], self.spacing[1]],
            origin: [self.origin[0], self.origin[1]],
            direction: [[d[0][0], d[0][1]], [d[1][0], d[1][1]]],
        }
    }
}

// ---------------------------------------------------------------------------
// SignalVolume – the RF input
// ---------------------------------------------------------------------------

/// One RF frame, indexed `[x, y]` with `x` the transform axis.
#[derive(Debug, Clone)]
pub struct Signal2 {
    pub samples: Array2<f32>,
    pub geometry: Geometry2,
}

/// A stack of RF frames, indexed `[x, y, z]`.
#[derive(Debug, Clone)]
pub struct Signal3 {
    pub samples: Array3<f32>,
    pub geometry: Geometry3,
}

impl Signal3 {
    pub fn depth(&self) -> usize {
        self.samples.len_of(Axis(2))
    }

    /// Frame at depth `k`, keeping the in-plane axes unchanged.
    pub fn slice(&self, k: usize) -> ArrayView2<'_, f32> {
        self.samples.index_axis(Axis(2), k)
    }
}

/// RF input of supported dimensionality.
#[derive(Debug, Clone)]
pub enum SignalVolume {
    Plane(Signal2),
    Volume(Signal3),
}

impl SignalVolume {
    /// Assemble a volume from `sizes` (fastest axis first) and samples stored
    /// with `x` varying fastest.
    pub fn from_parts(
        sizes: &[usize],
        samples: Vec<f32>,
        spacing: &[f64],
        origin: &[f64],
        direction: &[Vec<f64>],
    ) -> Result<Self> {
        let expected: usize = sizes.iter().product();
        if samples.len() != expected {
            return Err(PipelineError::invalid(
                "samples",
                format!("sizes {sizes:?} need {expected} samples, got {}", samples.len()),
            ));
        }

        match *sizes {
            [nx, ny] => {
                let samples = Array2::from_shape_vec((nx, ny).f(), samples)
                    .map_err(|e| PipelineError::invalid("samples", e.to_string()))?;
                Ok(SignalVolume::Plane(Signal2 {
                    samples,
                    geometry: Geometry2::from_parts(spacing, origin, direction)?,
                }))
            }
            [nx, ny, nz] => {
                let samples = Array3::from_shape_vec((nx, ny, nz).f(), samples)
                    .map_err(|e| PipelineError::invalid("samples", e.to_string()))?;
                Ok(SignalVolume::Volume(Signal3 {
                    samples,
                    geometry: Geometry3::from_parts(spacing, origin, direction)?,
                }))
            }
            _ => Err(PipelineError::UnsupportedDimensionality(sizes.len())),
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            SignalVolume::Plane(_) => 2,
            SignalVolume::Volume(_) => 3,
        }
    }

    /// Extent per axis, fastest first.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            SignalVolume::Plane(s) => s.samples.shape().to_vec(),
            SignalVolume::Volume(s) => s.samples.shape().to_vec(),
        }
    }

    pub fn spacing(&self) -> &[f64] {
        match self {
            SignalVolume::Plane(s) => &s.geometry.spacing,
            SignalVolume::Volume(s) => &s.geometry.spacing,
        }
    }

    pub fn origin(&self) -> &[f64] {
        match self {
            SignalVolume::Plane(s) => &s.geometry.origin,
            SignalVolume::Volume(s) => &s.geometry.origin,
        }
    }

    pub fn direction_rows(&self) -> Vec<Vec<f64>> {
        match self {
            SignalVolume::Plane(s) => s.geometry.direction_rows(),
            SignalVolume::Volume(s) => s.geometry.direction_rows(),
        }
    }

    /// Samples in file order (`x` fastest).
    pub fn samples_x_fastest(&self) -> Vec<f32> {
        match self {
            SignalVolume::Plane(s) => s.samples.t().iter().copied().collect(),
            SignalVolume::Volume(s) => s.samples.t().iter().copied().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// SpectralVolume – the result
// ---------------------------------------------------------------------------

/// Spectra of one frame, indexed `[x, y, c]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralSlice {
    pub data: Array3<f32>,
    pub geometry: Geometry2,
    /// Original bin index of each component.
    pub bins: Vec<i64>,
    pub params: SpectralParams,
}

/// Spectra of a frame stack, indexed `[x, y, z, c]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralStack {
    pub data: Array4<f32>,
    pub geometry: Geometry3,
    /// Depth coordinates, `origin_z + k * spacing_z`.
    pub z: Vec<f64>,
    pub bins: Vec<i64>,
    pub params: SpectralParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpectralVolume {
    Plane(SpectralSlice),
    Volume(SpectralStack),
}

impl SpectralVolume {
    /// Number of spatial axes.
    pub fn dimension(&self) -> usize {
        match self {
            SpectralVolume::Plane(_) => 2,
            SpectralVolume::Volume(_) => 3,
        }
    }

    /// Extent per axis, `[x, y, (z,) c]`.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            SpectralVolume::Plane(s) => s.data.shape().to_vec(),
            SpectralVolume::Volume(s) => s.data.shape().to_vec(),
        }
    }

    pub fn num_bins(&self) -> usize {
        self.bins().len()
    }

    pub fn bins(&self) -> &[i64] {
        match self {
            SpectralVolume::Plane(s) => &s.bins,
            SpectralVolume::Volume(s) => &s.bins,
        }
    }

    pub fn params(&self) -> &SpectralParams {
        match self {
            SpectralVolume::Plane(s) => &s.params,
            SpectralVolume::Volume(s) => &s.params,
        }
    }

    pub fn spacing(&self) -> &[f64] {
        match self {
            SpectralVolume::Plane(s) => &s.geometry.spacing,
            SpectralVolume::Volume(s) => &s.geometry.spacing,
        }
    }

    pub fn origin(&self) -> &[f64] {
        match self {
            SpectralVolume::Plane(s) => &s.geometry.origin,
            SpectralVolume::Volume(s) => &s.geometry.origin,
        }
    }

    pub fn direction_rows(&self) -> Vec<Vec<f64>> {
        match self {
            SpectralVolume::Plane(s) => s.geometry.direction_rows(),
            SpectralVolume::Volume(s) => s.geometry.direction_rows(),
        }
    }

    /// Dimension names in storage order (slowest first).
    pub fn dims(&self) -> &'static [&'static str] {
        match self {
            SpectralVolume::Plane(_) => &["y", "x", "c"],
            SpectralVolume::Volume(_) => &["z", "y", "x", "c"],
        }
    }

    /// Extent per dimension in storage order, matching [`dims()`](Self::dims).
    pub fn storage_shape(&self) -> Vec<usize> {
        let shape = self.shape();
        match self {
            SpectralVolume::Plane(_) => vec![shape[1], shape[0], shape[2]],
            SpectralVolume::Volume(_) => vec![shape[2], shape[1], shape[0], shape[3]],
        }
    }

    /// Coordinates of the spatial axis `name` (`x`, `y` or `z`).
    pub fn coordinates(&self, name: &str) -> Option<Vec<f64>> {
        let shape = self.shape();
        match (self, name) {
            (SpectralVolume::Plane(s), "x") => Some(s.geometry.axis_coordinates(0, shape[0])),
            (SpectralVolume::Plane(s), "y") => Some(s.geometry.axis_coordinates(1, shape[1])),
            (SpectralVolume::Volume(s), "x") => Some(s.geometry.axis_coordinates(0, shape[0])),
            (SpectralVolume::Volume(s), "y") => Some(s.geometry.axis_coordinates(1, shape[1])),
            (SpectralVolume::Volume(s), "z") => Some(s.z.clone()),
            _ => None,
        }
    }

    /// Samples in storage order: component fastest, then `x`, `y`, `z`.
    pub fn storage_values(&self) -> Vec<f32> {
        match self {
            SpectralVolume::Plane(s) => s.data.view().permuted_axes([1, 0, 2]).iter().copied().collect(),
            SpectralVolume::Volume(s) => s.data.view().permuted_axes([2, 1, 0, 3]).iter().copied().collect(),
        }
    }

    /// Samples of one depth layer in storage order. A plane has a single layer.
    pub fn layer_values(&self, k: usize) -> Option<Vec<f32>> {
        match self {
            SpectralVolume::Plane(_) if k == 0 => Some(self.storage_values()),
            SpectralVolume::Plane(_) => None,
            SpectralVolume::Volume(s) if k < s.data.len_of(Axis(2)) => Some(
                s.data
                    .index_axis(Axis(2), k)
                    .permuted_axes([1, 0, 2])
                    .iter()
                    .copied()
                    .collect(),
            ),
            SpectralVolume::Volume(_) => None,
        }
    }

    pub fn num_layers(&self) -> usize {
        match self {
            SpectralVolume::Plane(_) => 1,
            SpectralVolume::Volume(s) => s.data.len_of(Axis(2)),
        }
    }

    /// Rebuild `[x, y, c]` / `[x, y, z, c]` data from values in storage order.
    pub fn data_from_storage(storage_shape: &[usize], values: Vec<f32>) -> Result<SpectralData> {
        let bad = |e: ndarray::ShapeError| PipelineError::invalid("values", e.to_string());
        match *storage_shape {
            [ny, nx, nc] => {
                let data = Array3::from_shape_vec((ny, nx, nc), values).map_err(bad)?;
                Ok(SpectralData::Plane(
                    data.permuted_axes([1, 0, 2]).as_standard_layout().into_owned(),
                ))
            }
            [nz, ny, nx, nc] => {
                let data = Array4::from_shape_vec((nz, ny, nx, nc), values).map_err(bad)?;
                Ok(SpectralData::Volume(
                    data.permuted_axes([2, 1, 0, 3]).as_standard_layout().into_owned(),
                ))
            }
            _ => Err(PipelineError::UnsupportedDimensionality(
                storage_shape.len().saturating_sub(1),
            )),
        }
    }
}

/// Spectral sample arrays without geometry, as decoded from storage.
#[derive(Debug, Clone)]
pub enum SpectralData {
    Plane(Array3<f32>),
    Volume(Array4<f32>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_pads_orientation() {
        let plane = Geometry2 {
            spacing: [0.1, 0.2],
            origin: [1.0, 2.0],
            direction: [[0.0, 1.0], [-1.0, 0.5]],
        };
        let volume = plane.extend(0.5, -3.0);
        assert_eq!(
            volume.direction,
            [[0.0, 1.0, 0.0], [-1.0, 0.5, 0.0], [0.0, 0.0, 1.0]]
        );
        assert_eq!(volume.spacing, [0.1, 0.2, 0.5]);
        assert_eq!(volume.origin, [1.0, 2.0, -3.0]);
        assert_eq!(volume.in_plane(), plane);
    }

    #[test]
    fn from_parts_rejects_bad_dimensionality() {
        let err = SignalVolume::from_parts(&[4], vec![0.0; 4], &[1.0], &[0.0], &[vec![1.0]]).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedDimensionality(1)));

        let err = SignalVolume::from_parts(
            &[1, 1, 1, 1],
            vec![0.0],
            &[1.0; 4],
            &[0.0; 4],
            &[vec![0.0; 4], vec![0.0; 4], vec![0.0; 4], vec![0.0; 4]],
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedDimensionality(4)));
    }

    #[test]
    fn from_parts_reads_x_fastest() {
        let samples: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let volume = SignalVolume::from_parts(
            &[4, 3, 2],
            samples.clone(),
            &[1.0, 1.0, 1.0],
            &[0.0, 0.0, 0.0],
            &Geometry3::default().direction_rows(),
        )
        .unwrap();
        let SignalVolume::Volume(signal) = &volume else {
            panic!("expected a volume");
        };
        assert_eq!(signal.samples[[1, 0, 0]], 1.0);
        assert_eq!(signal.samples[[0, 1, 0]], 4.0);
        assert_eq!(signal.samples[[0, 0, 1]], 12.0);
        assert_eq!(volume.samples_x_fastest(), samples);
    }

    #[test]
    fn from_parts_checks_sample_count() {
        let err = SignalVolume::from_parts(
            &[4, 3],
            vec![0.0; 11],
            &[1.0, 1.0],
            &[0.0, 0.0],
            &Geometry2::default().direction_rows(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn storage_order_round_trips() {
        let data = Array4::from_shape_fn((3, 2, 2, 4), |(x, y, z, c)| (x + 10 * y + 100 * z + 1000 * c) as f32);
        let volume = SpectralVolume::Volume(SpectralStack {
            data: data.clone(),
            geometry: Geometry3::default(),
            z: vec![0.0, 1.0],
            bins: (0..4).collect(),
            params: SpectralParams::default(),
        });
        assert_eq!(volume.storage_shape(), vec![2, 2, 3, 4]);

        let values = volume.storage_values();
        // component varies fastest, then x
        assert_eq!(&values[..5], &[0.0, 1000.0, 2000.0, 3000.0, 1.0]);

        let SpectralData::Volume(back) = SpectralVolume::data_from_storage(&volume.storage_shape(), values).unwrap()
        else {
            panic!("expected a volume");
        };
        assert_eq!(back, data);
        assert_eq!(volume.layer_values(1).unwrap()[0], 100.0);
    }
}
