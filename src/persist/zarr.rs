//! Zarr v2 directory store laid out the way xarray writes a Dataset.
//!
//! ```text
//!  out.zarr/
//!    .zgroup  .zattrs  .zmetadata
//!    spectra/  .zarray .zattrs  k.0.0.0 ...   one chunk per depth layer
//!    x/ y/ z/ c/                               coordinate variables
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::data::model::{
    Geometry, SpectralData, SpectralSlice, SpectralStack, SpectralVolume,
};
use crate::error::{IoContext, PipelineError, Result};
use crate::persist::CancelFlag;
use crate::spectral::SpectralParams;

/// Name of the data variable holding the spectra.
pub const DATA_VARIABLE: &str = "spectra";

const ZARR_FORMAT: u8 = 2;

/// Compression levels accepted for the chunks.
pub const ZSTD_LEVELS: std::ops::RangeInclusive<i32> = 1..=22;

const PLANE_DIMS: [&str; 3] = ["y", "x", "c"];
const VOLUME_DIMS: [&str; 4] = ["z", "y", "x", "c"];

// ---------------------------------------------------------------------------
// Metadata documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compressor {
    pub id: String,
    #[serde(default)]
    pub level: i32,
}

/// Contents of a `.zarray` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMetadata {
    pub zarr_format: u8,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: String,
    pub compressor: Option<Compressor>,
    pub fill_value: JsonValue,
    pub order: String,
    pub filters: Option<Vec<JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension_separator: Option<String>,
}

impl ArrayMetadata {
    fn new<T: Element>(shape: Vec<usize>, chunks: Vec<usize>, level: i32) -> Self {
        Self {
            zarr_format: ZARR_FORMAT,
            shape,
            chunks,
            dtype: T::DTYPE.to_string(),
            compressor: Some(Compressor {
                id: "zstd".to_string(),
                level,
            }),
            fill_value: T::fill_json(),
            order: "C".to_string(),
            filters: None,
            dimension_separator: None,
        }
    }

    fn separator(&self) -> &str {
        self.dimension_separator.as_deref().unwrap_or(".")
    }
}

/// Dataset-level attributes: geometry plus analysis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetAttrs {
    pub spacing: Vec<f64>,
    pub origin: Vec<f64>,
    pub direction: Vec<Vec<f64>>,
    #[serde(flatten)]
    pub params: SpectralParams,
}

// ---------------------------------------------------------------------------
// Element encoding
// ---------------------------------------------------------------------------

trait Element: Copy {
    const DTYPE: &'static str;
    const WIDTH: usize;
    fn put(self, out: &mut Vec<u8>);
    fn get(bytes: &[u8]) -> Self;
    fn fill_json() -> JsonValue;
    fn fill(value: &JsonValue) -> Self;
}

impl Element for f32 {
    const DTYPE: &'static str = "<f4";
    const WIDTH: usize = 4;
    fn put(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn get(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
    fn fill_json() -> JsonValue {
        json!("NaN")
    }
    fn fill(value: &JsonValue) -> Self {
        value.as_f64().map_or(f32::NAN, |v| v as f32)
    }
}

impl Element for f64 {
    const DTYPE: &'static str = "<f8";
    const WIDTH: usize = 8;
    fn put(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn get(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(buf)
    }
    fn fill_json() -> JsonValue {
        json!("NaN")
    }
    fn fill(value: &JsonValue) -> Self {
        value.as_f64().unwrap_or(f64::NAN)
    }
}

impl Element for i64 {
    const DTYPE: &'static str = "<i8";
    const WIDTH: usize = 8;
    fn put(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn get(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        i64::from_le_bytes(buf)
    }
    fn fill_json() -> JsonValue {
        JsonValue::Null
    }
    fn fill(value: &JsonValue) -> Self {
        value.as_i64().unwrap_or(0)
    }
}

fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::WIDTH);
    for &v in values {
        v.put(&mut out);
    }
    out
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Collects every metadata document for the consolidated `.zmetadata`.
struct StoreWriter<'a> {
    root: &'a Path,
    level: i32,
    consolidated: BTreeMap<String, JsonValue>,
}

impl<'a> StoreWriter<'a> {
    fn json(&mut self, key: &str, value: JsonValue) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        let text = serde_json::to_vec_pretty(&value)
            .map_err(|e| PipelineError::format(&path, e.to_string()))?;
        fs::write(&path, text).at(&path)?;
        self.consolidated.insert(key.to_string(), value);
        Ok(())
    }

    fn array(&mut self, name: &str, meta: &ArrayMetadata, dims: &[&str]) -> Result<()> {
        let value = serde_json::to_value(meta)
            .map_err(|e| PipelineError::format(self.root, e.to_string()))?;
        self.json(&format!("{name}/.zarray"), value)?;
        self.json(&format!("{name}/.zattrs"), json!({ "_ARRAY_DIMENSIONS": dims }))
    }

    fn chunk<T: Element>(&self, name: &str, key: &str, values: &[T]) -> Result<()> {
        let path = self.root.join(name).join(key);
        let compressed = zstd::bulk::compress(&encode(values), self.level).at(&path)?;
        fs::write(&path, compressed).at(&path)
    }

    /// One-dimensional coordinate variable stored as a single chunk.
    fn coordinate<T: Element>(&mut self, name: &str, values: &[T]) -> Result<()> {
        let meta = ArrayMetadata::new::<T>(vec![values.len()], vec![values.len().max(1)], self.level);
        self.array(name, &meta, &[name])?;
        if !values.is_empty() {
            self.chunk(name, "0", values)?;
        }
        Ok(())
    }
}

/// Write `volume` as a Zarr v2 dataset rooted at `root` (created fresh).
pub fn write_zarr(volume: &SpectralVolume, root: &Path, level: i32, cancel: &CancelFlag) -> Result<()> {
    if !ZSTD_LEVELS.contains(&level) {
        return Err(PipelineError::invalid(
            "compression_level",
            format!("{level} is outside {}..={}", ZSTD_LEVELS.start(), ZSTD_LEVELS.end()),
        ));
    }
    fs::create_dir_all(root).at(root)?;
    let mut store = StoreWriter {
        root,
        level,
        consolidated: BTreeMap::new(),
    };

    store.json(".zgroup", json!({ "zarr_format": ZARR_FORMAT }))?;
    let attrs = DatasetAttrs {
        spacing: volume.spacing().to_vec(),
        origin: volume.origin().to_vec(),
        direction: volume.direction_rows(),
        params: *volume.params(),
    };
    let attrs = serde_json::to_value(&attrs).map_err(|e| PipelineError::format(root, e.to_string()))?;
    store.json(".zattrs", attrs)?;

    // data variable: one chunk per depth layer
    let shape = volume.storage_shape();
    let mut chunks: Vec<usize> = shape.iter().map(|&n| n.max(1)).collect();
    if volume.dimension() == 3 {
        chunks[0] = 1;
    }
    let meta = ArrayMetadata::new::<f32>(shape.clone(), chunks, level);
    store.array(DATA_VARIABLE, &meta, volume.dims())?;

    if shape.iter().all(|&n| n > 0) {
        let tail = ".0".repeat(shape.len() - 1);
        for k in 0..volume.num_layers() {
            cancel.check()?;
            let values = volume
                .layer_values(k)
                .ok_or(PipelineError::SliceCountMismatch {
                    expected: volume.num_layers(),
                    actual: k,
                })?;
            let key = if volume.dimension() == 3 {
                format!("{k}{tail}")
            } else {
                format!("0{tail}")
            };
            store.chunk(DATA_VARIABLE, &key, &values)?;
        }
    }

    cancel.check()?;
    for name in ["x", "y", "z"] {
        if let Some(coords) = volume.coordinates(name) {
            store.coordinate(name, &coords)?;
        }
    }
    store.coordinate("c", volume.bins())?;

    let consolidated = json!({
        "metadata": store.consolidated,
        "zarr_consolidated_format": 1,
    });
    let path = root.join(".zmetadata");
    let text = serde_json::to_vec_pretty(&consolidated).map_err(|e| PipelineError::format(&path, e.to_string()))?;
    fs::write(&path, text).at(&path)
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read access to a dataset written by [`write_zarr`].
#[derive(Debug, Clone)]
pub struct ZarrDataset {
    root: PathBuf,
    attrs: DatasetAttrs,
    meta: ArrayMetadata,
    dims: Vec<String>,
}

#[derive(Deserialize)]
struct VariableAttrs {
    #[serde(rename = "_ARRAY_DIMENSIONS")]
    dims: Vec<String>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read(path).at(path)?;
    serde_json::from_slice(&text).map_err(|e| PipelineError::format(path, e.to_string()))
}

impl ZarrDataset {
    pub fn open(root: &Path) -> Result<Self> {
        let attrs: DatasetAttrs = read_json(&root.join(".zattrs"))?;
        let meta: ArrayMetadata = read_json(&root.join(DATA_VARIABLE).join(".zarray"))?;
        let var: VariableAttrs = read_json(&root.join(DATA_VARIABLE).join(".zattrs"))?;

        if var.dims.len() != meta.shape.len() || meta.chunks.len() != meta.shape.len() {
            return Err(PipelineError::format(root, "dimension names do not match array rank"));
        }
        if var.dims != PLANE_DIMS && var.dims != VOLUME_DIMS {
            return Err(PipelineError::format(
                root,
                format!("expected dimensions {PLANE_DIMS:?} or {VOLUME_DIMS:?}, found {:?}", var.dims),
            ));
        }
        if meta.chunks.contains(&0) {
            return Err(PipelineError::format(root, "chunk extents must be positive"));
        }
        if meta.dtype != f32::DTYPE {
            return Err(PipelineError::format(root, format!("unsupported dtype {}", meta.dtype)));
        }

        Ok(Self {
            root: root.to_path_buf(),
            attrs,
            meta,
            dims: var.dims,
        })
    }

    pub fn attrs(&self) -> &DatasetAttrs {
        &self.attrs
    }

    /// Dimension names of the data variable, slowest first.
    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    /// Shape of the data variable, matching [`dims()`](Self::dims).
    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    pub fn array_metadata(&self) -> &ArrayMetadata {
        &self.meta
    }

    pub fn num_layers(&self) -> usize {
        if self.dims.len() == 4 {
            self.meta.shape[0]
        } else {
            1
        }
    }

    pub fn coordinate(&self, name: &str) -> Result<Vec<f64>> {
        self.read_variable::<f64>(name)
    }

    pub fn bins(&self) -> Result<Vec<i64>> {
        self.read_variable::<i64>("c")
    }

    fn read_variable<T: Element>(&self, name: &str) -> Result<Vec<T>> {
        let dir = self.root.join(name);
        let meta: ArrayMetadata = read_json(&dir.join(".zarray"))?;
        if meta.dtype != T::DTYPE {
            return Err(PipelineError::format(&dir, format!("expected dtype {}, found {}", T::DTYPE, meta.dtype)));
        }
        let rows = 0..meta.shape.first().copied().unwrap_or(0);
        read_rows(&dir, &meta, rows)
    }

    /// Decode the whole dataset.
    pub fn read(&self) -> Result<SpectralVolume> {
        let values = read_rows::<f32>(&self.root.join(DATA_VARIABLE), &self.meta, 0..self.meta.shape[0])?;
        let data = SpectralVolume::data_from_storage(&self.meta.shape, values)?;
        let bins = self.bins()?;
        let params = self.attrs.params;
        let bad = |e: PipelineError| PipelineError::format(&self.root, e.to_string());

        Ok(match data {
            SpectralData::Plane(data) => SpectralVolume::Plane(SpectralSlice {
                data,
                geometry: Geometry::from_parts(&self.attrs.spacing, &self.attrs.origin, &self.attrs.direction)
                    .map_err(bad)?,
                bins,
                params,
            }),
            SpectralData::Volume(data) => SpectralVolume::Volume(SpectralStack {
                data,
                geometry: Geometry::from_parts(&self.attrs.spacing, &self.attrs.origin, &self.attrs.direction)
                    .map_err(bad)?,
                z: self.coordinate("z")?,
                bins,
                params,
            }),
        })
    }

    /// Decode the single depth layer `k`, indexed `[x, y, c]`.
    ///
    /// Only the chunks covering that layer are read.
    pub fn read_layer(&self, k: usize) -> Result<Array3<f32>> {
        if k >= self.num_layers() {
            return Err(PipelineError::invalid(
                "layer",
                format!("{k} is outside 0..{}", self.num_layers()),
            ));
        }
        let dir = self.root.join(DATA_VARIABLE);
        let shape = &self.meta.shape;
        let (values, layer_shape) = if self.dims.len() == 4 {
            (read_rows::<f32>(&dir, &self.meta, k..k + 1)?, [shape[1], shape[2], shape[3]])
        } else {
            (read_rows::<f32>(&dir, &self.meta, 0..shape[0])?, [shape[0], shape[1], shape[2]])
        };
        let [ny, nx, nc] = layer_shape;
        let layer = Array3::from_shape_vec((ny, nx, nc), values)
            .map_err(|e| PipelineError::format(&dir, e.to_string()))?;
        Ok(layer.permuted_axes([1, 0, 2]).as_standard_layout().into_owned())
    }
}

/// Visit every multi-index below `extent` in C order. An empty extent is
/// visited once.
fn for_each_index(extent: &[usize], mut f: impl FnMut(&[usize]) -> Result<()>) -> Result<()> {
    if extent.iter().any(|&n| n == 0) {
        return Ok(());
    }
    let mut index = vec![0; extent.len()];
    loop {
        f(&index)?;
        let mut d = extent.len();
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            index[d] += 1;
            if index[d] < extent[d] {
                break;
            }
            index[d] = 0;
        }
    }
}

fn linear(index: &[usize], shape: &[usize]) -> usize {
    index.iter().zip(shape).fold(0, |acc, (&i, &n)| acc * n + i)
}

/// Decode rows `rows` of the first axis. Returns C-order values of shape
/// `[rows.len(), shape[1..]...]`; missing chunks read as the fill value.
fn read_rows<T: Element>(dir: &Path, meta: &ArrayMetadata, rows: Range<usize>) -> Result<Vec<T>> {
    let shape = &meta.shape;
    let chunks = &meta.chunks;
    let nd = shape.len();
    if meta.order != "C" {
        return Err(PipelineError::format(dir, format!("unsupported order {}", meta.order)));
    }
    if nd == 0 || chunks.len() != nd || chunks.iter().any(|&c| c == 0) {
        return Err(PipelineError::format(dir, "malformed chunk grid"));
    }
    if rows.end > shape[0] {
        return Err(PipelineError::format(dir, format!("rows {rows:?} outside 0..{}", shape[0])));
    }
    match &meta.compressor {
        Some(c) if c.id != "zstd" => {
            return Err(PipelineError::format(dir, format!("unsupported compressor {}", c.id)));
        }
        _ => {}
    }

    let mut out_shape = shape.clone();
    out_shape[0] = rows.len();
    let fill = T::fill(&meta.fill_value);
    let mut out = vec![fill; out_shape.iter().product()];
    if out.is_empty() {
        return Ok(out);
    }

    let first = rows.start / chunks[0];
    let last = (rows.end - 1) / chunks[0];
    let mut grid: Vec<usize> = shape.iter().zip(chunks).map(|(&n, &c)| n.div_ceil(c)).collect();
    grid[0] = last - first + 1;

    let chunk_len: usize = chunks.iter().product();
    let run_max = chunks[nd - 1];

    for_each_index(&grid, |grid_index| {
        let mut chunk_index = grid_index.to_vec();
        chunk_index[0] += first;

        let key = chunk_index
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(meta.separator());
        let path = dir.join(key);
        if !path.exists() {
            return Ok(());
        }

        let raw = fs::read(&path).at(&path)?;
        let bytes = match meta.compressor {
            Some(_) => zstd::decode_all(&raw[..]).at(&path)?,
            None => raw,
        };
        if bytes.len() != chunk_len * T::WIDTH {
            return Err(PipelineError::format(&path, "chunk has the wrong size"));
        }

        let chunk_origin: Vec<usize> = chunk_index.iter().zip(chunks).map(|(&i, &c)| i * c).collect();
        let run = run_max.min(shape[nd - 1] - chunk_origin[nd - 1]);

        for_each_index(&chunks[..nd - 1], |local| {
            let mut global = Vec::with_capacity(nd);
            for (d, &l) in local.iter().enumerate() {
                let g = chunk_origin[d] + l;
                if g >= shape[d] {
                    return Ok(());
                }
                global.push(g);
            }
            global.push(chunk_origin[nd - 1]);
            if !rows.contains(&global[0]) {
                return Ok(());
            }
            global[0] -= rows.start;

            let mut local_full = local.to_vec();
            local_full.push(0);
            let src = linear(&local_full, chunks);
            let dst = linear(&global, &out_shape);
            for i in 0..run {
                out[dst + i] = T::get(&bytes[(src + i) * T::WIDTH..]);
            }
            Ok(())
        })
    })?;

    Ok(out)
}
