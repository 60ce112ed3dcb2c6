use std::fmt;
use std::str::FromStr;

use ndarray::s;
use serde::{Deserialize, Serialize};

use super::model::{SpectralSlice, SpectralStack, SpectralVolume};
use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// Bin selection: which frequency components are kept
// ---------------------------------------------------------------------------

/// Half-open range of frequency bins `[start, end)` to keep.
///
/// Useful to drop the low-power bins at both ends of the band before
/// persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinSelection {
    pub start: usize,
    pub end: usize,
}

impl fmt::Display for BinSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Accepts `start..end` or `start:end`.
impl FromStr for BinSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (start, end) = s
            .split_once("..")
            .or_else(|| s.split_once(':'))
            .ok_or_else(|| format!("expected `start..end`, got '{s}'"))?;
        let parse = |tok: &str| {
            tok.trim()
                .parse::<usize>()
                .map_err(|_| format!("'{tok}' is not a bin index"))
        };
        Ok(BinSelection {
            start: parse(start)?,
            end: parse(end)?,
        })
    }
}

impl BinSelection {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, num_bins: usize) -> Result<()> {
        if self.is_empty() || self.end > num_bins {
            return Err(PipelineError::invalid(
                "bins",
                format!("selection {self} is empty or outside 0..{num_bins}"),
            ));
        }
        Ok(())
    }
}

/// Keep only the selected bins. The `c` coordinate keeps the original
/// bin indices.
pub fn select_bins(volume: SpectralVolume, selection: &BinSelection) -> Result<SpectralVolume> {
    selection.check(volume.num_bins())?;
    let range = selection.start..selection.end;

    Ok(match volume {
        SpectralVolume::Plane(slice) => SpectralVolume::Plane(SpectralSlice {
            data: slice.data.slice(s![.., .., range.clone()]).to_owned(),
            bins: slice.bins[range].to_vec(),
            ..slice
        }),
        SpectralVolume::Volume(stack) => SpectralVolume::Volume(SpectralStack {
            data: stack.data.slice(s![.., .., .., range.clone()]).to_owned(),
            bins: stack.bins[range].to_vec(),
            ..stack
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::Geometry2;
    use crate::spectral::SpectralParams;
    use ndarray::Array3;

    fn plane(bins: usize) -> SpectralVolume {
        SpectralVolume::Plane(SpectralSlice {
            data: Array3::from_shape_fn((2, 3, bins), |(_, _, c)| c as f32),
            geometry: Geometry2::default(),
            bins: (0..bins as i64).collect(),
            params: SpectralParams::default(),
        })
    }

    #[test]
    fn keeps_requested_bins_and_labels() {
        let selected = select_bins(plane(17), &BinSelection { start: 5, end: 9 }).unwrap();
        assert_eq!(selected.shape(), vec![2, 3, 4]);
        assert_eq!(selected.bins(), &[5, 6, 7, 8]);
        let SpectralVolume::Plane(slice) = selected else {
            panic!("expected a plane");
        };
        assert_eq!(slice.data[[1, 2, 0]], 5.0);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(select_bins(plane(17), &BinSelection { start: 10, end: 18 }).is_err());
        assert!(select_bins(plane(17), &BinSelection { start: 4, end: 4 }).is_err());
    }

    #[test]
    fn parses_both_separators() {
        assert_eq!("5..20".parse(), Ok(BinSelection { start: 5, end: 20 }));
        assert_eq!("5:20".parse(), Ok(BinSelection { start: 5, end: 20 }));
        assert!("5-20".parse::<BinSelection>().is_err());
    }
}
