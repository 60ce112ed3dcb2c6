//! NRRD single-file images (attached header, raw or gzip encoding).
//!
//! Only what the pipeline needs: scalar or vector sample grids with
//! `space directions` / `space origin` geometry.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::data::model::{
    Geometry, Geometry2, Geometry3, SignalVolume, SpectralData, SpectralSlice, SpectralStack,
    SpectralVolume,
};
use crate::error::{IoContext, PipelineError, Result};
use crate::persist::CancelFlag;
use crate::spectral::SpectralParams;

const MAGIC_PREFIX: &str = "NRRD000";

// ---------------------------------------------------------------------------
// Header model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float,
    Double,
}

impl SampleType {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "signed char" | "int8" | "int8_t" => SampleType::Int8,
            "uchar" | "unsigned char" | "uint8" | "uint8_t" => SampleType::UInt8,
            "short" | "short int" | "signed short" | "signed short int" | "int16" | "int16_t" => {
                SampleType::Int16
            }
            "ushort" | "unsigned short" | "unsigned short int" | "uint16" | "uint16_t" => {
                SampleType::UInt16
            }
            "int" | "signed int" | "int32" | "int32_t" => SampleType::Int32,
            "uint" | "unsigned int" | "uint32" | "uint32_t" => SampleType::UInt32,
            "float" => SampleType::Float,
            "double" => SampleType::Double,
            _ => return None,
        })
    }

    fn width(self) -> usize {
        match self {
            SampleType::Int8 | SampleType::UInt8 => 1,
            SampleType::Int16 | SampleType::UInt16 => 2,
            SampleType::Int32 | SampleType::UInt32 | SampleType::Float => 4,
            SampleType::Double => 8,
        }
    }

    fn decode(self, bytes: &[u8], little: bool) -> f32 {
        macro_rules! num {
            ($t:ty, $n:expr) => {{
                let mut buf = [0u8; $n];
                buf.copy_from_slice(bytes);
                if little {
                    <$t>::from_le_bytes(buf)
                } else {
                    <$t>::from_be_bytes(buf)
                }
            }};
        }
        match self {
            SampleType::Int8 => bytes[0] as i8 as f32,
            SampleType::UInt8 => bytes[0] as f32,
            SampleType::Int16 => num!(i16, 2) as f32,
            SampleType::UInt16 => num!(u16, 2) as f32,
            SampleType::Int32 => num!(i32, 4) as f32,
            SampleType::UInt32 => num!(u32, 4) as f32,
            SampleType::Float => num!(f32, 4),
            SampleType::Double => num!(f64, 8) as f32,
        }
    }
}

/// Parsed NRRD header. Axis order is file order (fastest first).
#[derive(Debug, Clone)]
pub struct NrrdHeader {
    pub sample_type: SampleType,
    pub sizes: Vec<usize>,
    pub kinds: Vec<String>,
    /// One entry per axis; `None` for non-spatial axes.
    pub space_directions: Vec<Option<Vec<f64>>>,
    pub space_origin: Option<Vec<f64>>,
    pub spacings: Option<Vec<f64>>,
    pub little_endian: bool,
    pub gzip: bool,
    /// `key:=value` pairs.
    pub key_values: BTreeMap<String, String>,
}

/// Samples plus header, converted to `f32`.
#[derive(Debug, Clone)]
pub struct NrrdImage {
    pub header: NrrdHeader,
    pub samples: Vec<f32>,
}

impl NrrdImage {
    /// Index of every spatial (non-`vector`) axis.
    pub fn domain_axes(&self) -> Vec<usize> {
        (0..self.header.sizes.len())
            .filter(|&i| {
                self.header
                    .kinds
                    .get(i)
                    .map_or(true, |k| k != "vector" && k != "list")
            })
            .collect()
    }

    /// Geometry of the spatial axes. Exact `spacing`/`direction` key/value
    /// pairs written by this crate take precedence over `space directions`.
    fn geometry<const D: usize>(&self, path: &Path) -> Result<Geometry<D>> {
        let header = &self.header;
        let axes = self.domain_axes();
        if axes.len() != D {
            return Err(PipelineError::format(
                path,
                format!("expected {D} spatial axes, found {}", axes.len()),
            ));
        }

        let origin = header.space_origin.clone().unwrap_or_else(|| vec![0.0; D]);
        let parse_list = |key: &str| -> Option<Vec<f64>> {
            header
                .key_values
                .get(key)
                .and_then(|v| v.split_whitespace().map(|t| t.parse().ok()).collect())
        };

        if let (Some(spacing), Some(flat)) = (parse_list("spacing"), parse_list("direction")) {
            if flat.len() == D * D {
                let direction: Vec<Vec<f64>> = flat.chunks(D).map(|r| r.to_vec()).collect();
                return Geometry::from_parts(&spacing, &origin, &direction)
                    .map_err(|e| PipelineError::format(path, e.to_string()));
            }
        }

        let mut spacing = vec![1.0; D];
        let mut direction = vec![vec![0.0; D]; D];
        for (i, &axis) in axes.iter().enumerate() {
            match header.space_directions.get(axis).cloned().flatten() {
                Some(v) if v.len() == D => {
                    let norm = v.iter().map(|c| c * c).sum::<f64>().sqrt();
                    if norm == 0.0 {
                        return Err(PipelineError::format(path, "zero-length space direction"));
                    }
                    spacing[i] = norm;
                    for (row, c) in v.iter().enumerate() {
                        direction[row][i] = c / norm;
                    }
                }
                Some(v) => {
                    return Err(PipelineError::format(
                        path,
                        format!("space direction {v:?} does not have {D} components"),
                    ))
                }
                None => {
                    spacing[i] = header
                        .spacings
                        .as_ref()
                        .and_then(|s| s.get(axis).copied())
                        .filter(|s| s.is_finite() && *s > 0.0)
                        .unwrap_or(1.0);
                    direction[i][i] = 1.0;
                }
            }
        }
        Geometry::from_parts(&spacing, &origin, &direction)
            .map_err(|e| PipelineError::format(path, e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

pub fn read_nrrd(path: &Path) -> Result<NrrdImage> {
    let bytes = fs::read(path).at(path)?;
    let (header, offset) = parse_header(&bytes, path)?;

    let payload = &bytes[offset..];
    let raw = if header.gzip {
        let mut out = Vec::new();
        GzDecoder::new(payload).read_to_end(&mut out).at(path)?;
        out
    } else {
        payload.to_vec()
    };

    let count: usize = header.sizes.iter().product();
    let width = header.sample_type.width();
    if raw.len() < count * width {
        return Err(PipelineError::format(
            path,
            format!("expected {} bytes of samples, found {}", count * width, raw.len()),
        ));
    }

    let samples = raw[..count * width]
        .chunks_exact(width)
        .map(|b| header.sample_type.decode(b, header.little_endian))
        .collect();

    Ok(NrrdImage { header, samples })
}

fn parse_header(bytes: &[u8], path: &Path) -> Result<(NrrdHeader, usize)> {
    // header ends at the first blank line
    let end = bytes
        .windows(2)
        .position(|w| w == b"\n\n")
        .ok_or_else(|| PipelineError::format(path, "no end of header"))?;
    let text = std::str::from_utf8(&bytes[..end])
        .map_err(|_| PipelineError::format(path, "header is not UTF-8"))?;

    let mut lines = text.lines();
    let magic = lines.next().unwrap_or("").trim();
    if !magic.starts_with(MAGIC_PREFIX) {
        return Err(PipelineError::format(path, format!("bad magic '{magic}'")));
    }

    let mut fields = BTreeMap::new();
    let mut key_values = BTreeMap::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        if let Some((k, v)) = line.split_once(":=") {
            key_values.insert(k.to_string(), v.to_string());
        } else if let Some((k, v)) = line.split_once(": ") {
            fields.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        } else {
            return Err(PipelineError::format(path, format!("unreadable header line '{line}'")));
        }
    }

    let field = |name: &str| -> Result<&String> {
        fields
            .get(name)
            .ok_or_else(|| PipelineError::format(path, format!("missing field '{name}'")))
    };

    if fields.contains_key("data file") || fields.contains_key("datafile") {
        return Err(PipelineError::format(path, "detached data files are not supported"));
    }

    let sample_type = SampleType::parse(field("type")?)
        .ok_or_else(|| PipelineError::format(path, "unsupported sample type"))?;
    let dimension: usize = field("dimension")?
        .parse()
        .map_err(|_| PipelineError::format(path, "bad dimension"))?;
    let sizes: Vec<usize> = field("sizes")?
        .split_whitespace()
        .map(|t| t.parse())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| PipelineError::format(path, "bad sizes"))?;
    if sizes.len() != dimension {
        return Err(PipelineError::format(path, "sizes do not match dimension"));
    }

    let kinds = fields
        .get("kinds")
        .map(|k| k.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let space_directions = match fields.get("space directions") {
        Some(v) => parse_directions(v).ok_or_else(|| PipelineError::format(path, "bad space directions"))?,
        None => Vec::new(),
    };
    let space_origin = match fields.get("space origin") {
        Some(v) => Some(parse_vector(v).ok_or_else(|| PipelineError::format(path, "bad space origin"))?),
        None => None,
    };
    let spacings = fields
        .get("spacings")
        .map(|v| v.split_whitespace().map(|t| t.parse().unwrap_or(f64::NAN)).collect());

    let gzip = match field("encoding")?.as_str() {
        "raw" => false,
        "gzip" | "gz" => true,
        other => return Err(PipelineError::format(path, format!("unsupported encoding '{other}'"))),
    };
    let little_endian = fields.get("endian").map_or(true, |e| e == "little");

    Ok((
        NrrdHeader {
            sample_type,
            sizes,
            kinds,
            space_directions,
            space_origin,
            spacings,
            little_endian,
            gzip,
            key_values,
        },
        end + 2,
    ))
}

/// `(a,b,c)` → `[a, b, c]`
fn parse_vector(s: &str) -> Option<Vec<f64>> {
    let inner = s.trim().strip_prefix('(')?.strip_suffix(')')?;
    inner.split(',').map(|t| t.trim().parse().ok()).collect()
}

/// `none (a,b) (c,d)` → `[None, Some([a, b]), Some([c, d])]`
fn parse_directions(s: &str) -> Option<Vec<Option<Vec<f64>>>> {
    let mut out = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("none") {
            out.push(None);
            rest = r.trim_start();
        } else if rest.starts_with('(') {
            let close = rest.find(')')?;
            out.push(Some(parse_vector(&rest[..=close])?));
            rest = rest[close + 1..].trim_start();
        } else {
            return None;
        }
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

fn format_vector(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|c| c.to_string()).collect();
    format!("({})", parts.join(","))
}

fn format_list<T: ToString>(v: &[T]) -> String {
    v.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(" ")
}

/// Header text for a float grid. `vector_len` adds a leading component axis.
fn build_header(
    sizes: &[usize],
    vector_len: Option<usize>,
    spacing: &[f64],
    origin: &[f64],
    direction: &[Vec<f64>],
    gzip: bool,
    extra: &[(&str, String)],
) -> String {
    let d = spacing.len();
    let mut all_sizes = Vec::new();
    let mut kinds = Vec::new();
    let mut directions = Vec::new();
    if let Some(n) = vector_len {
        all_sizes.push(n);
        kinds.push("vector");
        directions.push("none".to_string());
    }
    for (i, &size) in sizes.iter().enumerate() {
        all_sizes.push(size);
        kinds.push("domain");
        let column: Vec<f64> = (0..d).map(|row| direction[row][i] * spacing[i]).collect();
        directions.push(format_vector(&column));
    }

    let flat_direction: Vec<f64> = direction.iter().flatten().copied().collect();

    let mut h = String::new();
    h.push_str("NRRD0004\n");
    h.push_str("# Complete NRRD file format specification at:\n");
    h.push_str("# http://teem.sourceforge.net/nrrd/format.html\n");
    h.push_str("type: float\n");
    h.push_str(&format!("dimension: {}\n", all_sizes.len()));
    h.push_str(&format!("space dimension: {d}\n"));
    h.push_str(&format!("sizes: {}\n", format_list(&all_sizes)));
    h.push_str(&format!("space directions: {}\n", directions.join(" ")));
    h.push_str(&format!("kinds: {}\n", kinds.join(" ")));
    h.push_str("endian: little\n");
    h.push_str(&format!("encoding: {}\n", if gzip { "gzip" } else { "raw" }));
    h.push_str(&format!("space origin: {}\n", format_vector(origin)));
    h.push_str(&format!("spacing:={}\n", format_list(spacing)));
    h.push_str(&format!("direction:={}\n", format_list(&flat_direction)));
    for (key, value) in extra {
        h.push_str(&format!("{key}:={value}\n"));
    }
    h.push('\n');
    h
}

fn write_file(path: &Path, header: &str, values: &[f32], gzip: bool, cancel: &CancelFlag) -> Result<()> {
    let mut file = std::io::BufWriter::new(fs::File::create(path).at(path)?);
    file.write_all(header.as_bytes()).at(path)?;

    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    cancel.check()?;

    if gzip {
        let mut encoder = GzEncoder::new(file, Compression::default());
        // chunked so a cancellation is noticed mid-write
        for block in bytes.chunks(1 << 20) {
            cancel.check()?;
            encoder.write_all(block).at(path)?;
        }
        encoder.finish().at(path)?.flush().at(path)?;
    } else {
        file.write_all(&bytes).at(path)?;
        file.flush().at(path)?;
    }
    Ok(())
}

/// Write a Spectral Volume: component axis first, then `x`, `y`, `z`.
pub fn write_spectral(volume: &SpectralVolume, path: &Path, gzip: bool, cancel: &CancelFlag) -> Result<()> {
    let shape = volume.shape();
    let (spatial, bins) = shape.split_at(shape.len() - 1);
    let params = volume.params();
    let extra = [
        ("fft_size", params.fft_size.to_string()),
        ("step", params.step.to_string()),
        ("side_lines", params.side_lines.to_string()),
        ("window", params.window.to_string()),
        ("scale", params.scale.to_string()),
        ("bins", format_list(volume.bins())),
    ];
    let header = build_header(
        spatial,
        Some(bins[0]),
        volume.spacing(),
        volume.origin(),
        &volume.direction_rows(),
        gzip,
        &extra,
    );
    write_file(path, &header, &volume.storage_values(), gzip, cancel)
}

/// Write an RF signal volume as a scalar image.
pub fn write_signal(signal: &SignalVolume, path: &Path, gzip: bool) -> Result<()> {
    let header = build_header(
        &signal.shape(),
        None,
        signal.spacing(),
        signal.origin(),
        &signal.direction_rows(),
        gzip,
        &[],
    );
    write_file(path, &header, &signal.samples_x_fastest(), gzip, &CancelFlag::default())
}

/// Read an RF signal volume (scalar image with 2 or 3 axes).
pub fn read_signal(path: &Path) -> Result<SignalVolume> {
    let image = read_nrrd(path)?;
    let sizes = image.header.sizes.clone();
    if image.domain_axes().len() != sizes.len() {
        return Err(PipelineError::format(path, "expected a scalar image"));
    }

    let (spacing, origin, direction) = match sizes.len() {
        2 => {
            let g: Geometry2 = image.geometry(path)?;
            (g.spacing.to_vec(), g.origin.to_vec(), g.direction_rows())
        }
        3 => {
            let g: Geometry3 = image.geometry(path)?;
            (g.spacing.to_vec(), g.origin.to_vec(), g.direction_rows())
        }
        n => return Err(PipelineError::UnsupportedDimensionality(n)),
    };
    SignalVolume::from_parts(&sizes, image.samples, &spacing, &origin, &direction)
}

/// Read back a Spectral Volume written by [`write_spectral`].
pub fn read_spectral(path: &Path) -> Result<SpectralVolume> {
    let image = read_nrrd(path)?;
    let header = &image.header;
    if header.kinds.first().map(String::as_str) != Some("vector") {
        return Err(PipelineError::format(path, "first axis is not a vector axis"));
    }

    let kv = |key: &str| header.key_values.get(key);
    let defaults = SpectralParams::default();
    let params = SpectralParams {
        fft_size: kv("fft_size").and_then(|v| v.parse().ok()).unwrap_or(defaults.fft_size),
        step: kv("step").and_then(|v| v.parse().ok()).unwrap_or(defaults.step),
        side_lines: kv("side_lines").and_then(|v| v.parse().ok()).unwrap_or(defaults.side_lines),
        window: kv("window").and_then(|v| v.parse().ok()).unwrap_or(defaults.window),
        scale: kv("scale").and_then(|v| v.parse().ok()).unwrap_or(defaults.scale),
    };
    let num_bins = header.sizes[0];
    let bins: Vec<i64> = kv("bins")
        .and_then(|v| v.split_whitespace().map(|t| t.parse().ok()).collect())
        .unwrap_or_else(|| (0..num_bins as i64).collect());

    let storage_shape: Vec<usize> = header.sizes.iter().rev().copied().collect();
    let data = SpectralVolume::data_from_storage(&storage_shape, image.samples.clone())?;

    match data {
        SpectralData::Plane(data) => Ok(SpectralVolume::Plane(SpectralSlice {
            data,
            geometry: image.geometry(path)?,
            bins,
            params,
        })),
        SpectralData::Volume(data) => {
            let geometry: Geometry3 = image.geometry(path)?;
            let depth = header.sizes[3];
            Ok(SpectralVolume::Volume(SpectralStack {
                data,
                z: geometry.axis_coordinates(2, depth),
                geometry,
                bins,
                params,
            }))
        }
    }
}
