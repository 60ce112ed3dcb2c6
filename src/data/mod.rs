/// Data layer: RF input, spectral result, loading and bin selection.
///
/// Architecture:
/// ```text
///  .nrrd / .json / .parquet
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse file → SignalVolume
///   └──────────┘
///        │
///        ▼
///   ┌──────────────┐
///   │ SignalVolume  │  samples [x, y, (z)] + geometry
///   └──────────────┘
///        │  (orchestrate)
///        ▼
///   ┌──────────┐
///   │  select   │  keep a bin range of the SpectralVolume
///   └──────────┘
/// ```

pub mod loader;
pub mod model;
pub mod select;
