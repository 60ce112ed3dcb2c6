use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{Array, Float32Array, Float64Array, Int32Array, Int64Array, LargeListArray, ListArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Deserialize;

use super::model::SignalVolume;
use crate::persist::nrrd;

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load an RF signal volume from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.nrrd`    – scalar NRRD image with 2 or 3 axes (raw or gzip)
/// * `.json`    – `{ "sizes": [...], "samples": [...], ...geometry }`
/// * `.parquet` – one RF line per row (`line`, optional `frame`, `samples`)
pub fn load_file(path: &Path) -> Result<SignalVolume> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "nrrd" => Ok(nrrd::read_signal(path)?),
        "json" => load_json(path),
        "parquet" | "pq" => load_parquet(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
}

/// Identity geometry parts for a `dim`-dimensional grid.
fn default_geometry(dim: usize) -> (Vec<f64>, Vec<f64>, Vec<Vec<f64>>) {
    let direction = (0..dim)
        .map(|r| (0..dim).map(|c| if r == c { 1.0 } else { 0.0 }).collect())
        .collect();
    (vec![1.0; dim], vec![0.0; dim], direction)
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema, samples listed with `x` varying fastest:
///
/// ```json
/// {
///   "sizes":     [64, 8, 5],
///   "spacing":   [0.05, 0.3, 0.7],
///   "origin":    [0.0, 0.0, 0.0],
///   "direction": [[1, 0, 0], [0, 1, 0], [0, 0, 1]],
///   "samples":   [0.12, -0.4, ...]
/// }
/// ```
///
/// `spacing`, `origin` and `direction` default to the identity grid.
#[derive(Debug, Deserialize)]
struct JsonSignal {
    sizes: Vec<usize>,
    spacing: Option<Vec<f64>>,
    origin: Option<Vec<f64>>,
    direction: Option<Vec<Vec<f64>>>,
    samples: Vec<f32>,
}

fn load_json(path: &Path) -> Result<SignalVolume> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let doc: JsonSignal = serde_json::from_str(&text).context("parsing JSON")?;

    let (spacing, origin, direction) = default_geometry(doc.sizes.len());
    Ok(SignalVolume::from_parts(
        &doc.sizes,
        doc.samples,
        &doc.spacing.unwrap_or(spacing),
        &doc.origin.unwrap_or(origin),
        &doc.direction.unwrap_or(direction),
    )?)
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// One RF line read from a table row.
struct RfLine {
    line: i64,
    frame: i64,
    samples: Vec<f32>,
}

/// Load a Parquet RF line table.
///
/// Expected schema:
/// - `line`: Int64 (or Int32) – lateral index `y`, from 0
/// - `frame`: Int64 (or Int32), optional – depth index `z`, from 0. Without it
///   the table is a single 2D frame.
/// - `samples`: List<Float32|Float64> or LargeList – one RF line along `x`
///
/// Geometry comes from the file key/value metadata `spacing`, `origin` and
/// `direction`, each holding JSON text. Missing keys give the identity grid.
fn load_parquet(path: &Path) -> Result<SignalVolume> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;

    let key_values: HashMap<String, String> = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .map(|kv| {
            kv.iter()
                .filter_map(|entry| Some((entry.key.clone(), entry.value.clone()?)))
                .collect()
        })
        .unwrap_or_default();

    let reader = builder.build().context("building parquet reader")?;

    let mut lines = Vec::new();
    let mut has_frames = false;
    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let line_col = int_column(&batch, "line")?
            .context("Parquet file missing 'line' column")?;
        let frame_col = int_column(&batch, "frame")?;
        has_frames |= frame_col.is_some();

        let samples_idx = batch
            .schema()
            .index_of("samples")
            .map_err(|_| anyhow::anyhow!("Parquet file missing 'samples' column"))?;
        let samples_col = batch.column(samples_idx);

        for row in 0..batch.num_rows() {
            let samples = extract_f32_list(samples_col, row)
                .with_context(|| format!("Row {row}: failed to read 'samples'"))?;
            lines.push(RfLine {
                line: line_col[row],
                frame: frame_col.as_ref().map_or(0, |f| f[row]),
                samples,
            });
        }
    }

    let dim = if has_frames { 3 } else { 2 };
    let (spacing, origin, direction) = default_geometry(dim);
    let spacing: Vec<f64> = metadata_json(&key_values, "spacing")?.unwrap_or(spacing);
    let origin: Vec<f64> = metadata_json(&key_values, "origin")?.unwrap_or(origin);
    let direction: Vec<Vec<f64>> = metadata_json(&key_values, "direction")?.unwrap_or(direction);

    let (sizes, samples) = assemble_lines(lines, has_frames)?;
    Ok(SignalVolume::from_parts(&sizes, samples, &spacing, &origin, &direction)?)
}

fn metadata_json<T: serde::de::DeserializeOwned>(
    key_values: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>> {
    key_values
        .get(key)
        .map(|text| {
            serde_json::from_str(text).with_context(|| format!("parsing '{key}' metadata"))
        })
        .transpose()
}

/// Place every line at `(line, frame)`; sample order is `x` fastest.
fn assemble_lines(lines: Vec<RfLine>, has_frames: bool) -> Result<(Vec<usize>, Vec<f32>)> {
    let Some(first) = lines.first() else {
        bail!("Parquet file holds no RF lines");
    };
    let nx = first.samples.len();

    let mut ny = 0;
    let mut nz = 0;
    for (row, rf) in lines.iter().enumerate() {
        if rf.line < 0 || rf.frame < 0 {
            bail!("Row {row}: negative line or frame index");
        }
        if rf.samples.len() != nx {
            bail!("Row {row}: line has {} samples, expected {nx}", rf.samples.len());
        }
        ny = ny.max(rf.line as usize + 1);
        nz = nz.max(rf.frame as usize + 1);
    }
    if lines.len() != ny * nz {
        bail!(
            "Expected {} RF lines for {ny} lines x {nz} frames, found {}",
            ny * nz,
            lines.len()
        );
    }

    let mut samples = vec![0.0f32; nx * ny * nz];
    let mut seen = vec![false; ny * nz];
    for rf in lines {
        let slot = rf.line as usize + ny * rf.frame as usize;
        if std::mem::replace(&mut seen[slot], true) {
            bail!("Duplicate RF line {} in frame {}", rf.line, rf.frame);
        }
        samples[slot * nx..(slot + 1) * nx].copy_from_slice(&rf.samples);
    }

    let sizes = if has_frames { vec![nx, ny, nz] } else { vec![nx, ny] };
    Ok((sizes, samples))
}

// -- Parquet / Arrow helpers --

/// Read an integer column as `i64`, `None` when absent.
fn int_column(batch: &RecordBatch, name: &str) -> Result<Option<Vec<i64>>> {
    let Ok(idx) = batch.schema().index_of(name) else {
        return Ok(None);
    };
    let col = batch.column(idx);
    if col.null_count() > 0 {
        bail!("null value in '{name}' column");
    }

    let values = match col.data_type() {
        DataType::Int64 => col
            .as_any()
            .downcast_ref::<Int64Array>()
            .context("expected Int64Array")?
            .values()
            .to_vec(),
        DataType::Int32 => col
            .as_any()
            .downcast_ref::<Int32Array>()
            .context("expected Int32Array")?
            .values()
            .iter()
            .map(|&v| v as i64)
            .collect(),
        other => bail!("Column '{name}' is {other:?}, expected Int64 or Int32"),
    };
    Ok(Some(values))
}

/// Extract a `Vec<f32>` from a List or LargeList column at the given row.
fn extract_f32_list(col: &Arc<dyn Array>, row: usize) -> Result<Vec<f32>> {
    if col.is_null(row) {
        bail!("null value in list column");
    }

    let values_array = match col.data_type() {
        DataType::List(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<ListArray>()
                .context("expected ListArray")?;
            list_arr.value(row)
        }
        DataType::LargeList(_) => {
            let list_arr = col
                .as_any()
                .downcast_ref::<LargeListArray>()
                .context("expected LargeListArray")?;
            list_arr.value(row)
        }
        other => bail!("Expected List or LargeList column, got {other:?}"),
    };

    // The inner array can be Float32 or Float64
    if let Some(f32_arr) = values_array.as_any().downcast_ref::<Float32Array>() {
        Ok(f32_arr.iter().map(|v| v.unwrap_or(f32::NAN)).collect())
    } else if let Some(f64_arr) = values_array.as_any().downcast_ref::<Float64Array>() {
        Ok(f64_arr.iter().map(|v| v.unwrap_or(f64::NAN) as f32).collect())
    } else {
        bail!(
            "List inner type is {:?}, expected Float32 or Float64",
            values_array.data_type()
        )
    }
}
