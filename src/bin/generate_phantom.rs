//! Writes a synthetic RF volume: Hann-windowed sinusoidal bursts at known
//! frequencies plus Gaussian noise, one burst train per RF line.
//!
//! ```bash
//! generate_phantom --output phantom --frames 5
//! rf-spectra -i phantom.parquet -o phantom_spectra
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Array, Float32Builder, Int64Array, ListBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::{Parser, ValueEnum};
use log::info;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;

use rf_spectra::persist::nrrd;
use rf_spectra::SignalVolume;

/// (centre sample, half width in samples, cycles per sample, amplitude)
const BURSTS: [(f64, f64, f64, f64); 3] = [
    (48.0, 24.0, 0.125, 1.0),
    (128.0, 32.0, 0.25, 0.8),
    (200.0, 20.0, 0.375, 0.6),
];

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Parquet,
    Nrrd,
    Both,
}

#[derive(Parser)]
#[command(name = "generate_phantom")]
#[command(about = "Write a synthetic RF volume for rf-spectra")]
struct Cli {
    /// Output base path; `.parquet` / `.nrrd` are appended
    #[arg(short, long, default_value = "phantom")]
    output: PathBuf,

    #[arg(long, value_enum, default_value = "both")]
    format: Format,

    /// Samples per RF line (transform axis)
    #[arg(long, default_value = "256")]
    samples: usize,

    /// RF lines per frame
    #[arg(long, default_value = "32")]
    lines: usize,

    /// Frames; 0 writes a single 2D frame
    #[arg(long, default_value = "5")]
    frames: usize,

    /// Standard deviation of the added noise
    #[arg(long, default_value = "0.05")]
    noise: f64,

    #[arg(long, default_value = "42")]
    seed: u64,
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

fn burst(x: f64, centre: f64, half_width: f64, freq: f64, amplitude: f64) -> f64 {
    let u = (x - centre) / half_width;
    if u.abs() >= 1.0 {
        return 0.0;
    }
    let envelope = 0.5 * (1.0 + (std::f64::consts::PI * u).cos());
    amplitude * envelope * (2.0 * std::f64::consts::PI * freq * x).sin()
}

fn rf_line(samples: usize, gain: f64, noise: f64, rng: &mut SimpleRng) -> Vec<f32> {
    (0..samples)
        .map(|i| {
            let x = i as f64;
            let signal: f64 = BURSTS
                .iter()
                .map(|&(c, w, f, a)| burst(x, c, w, f, a * gain))
                .sum();
            (signal + rng.gauss(0.0, noise)) as f32
        })
        .collect()
}

fn write_parquet(path: &Path, signal: &SignalVolume) -> Result<()> {
    let shape = signal.shape();
    let (nx, ny) = (shape[0], shape[1]);
    let nz = shape.get(2).copied();
    let values = signal.samples_x_fastest();

    let mut samples = ListBuilder::new(Float32Builder::new());
    let mut lines = Vec::new();
    let mut frames = Vec::new();
    for (slot, line) in values.chunks(nx).enumerate() {
        samples.values().append_slice(line);
        samples.append(true);
        lines.push((slot % ny) as i64);
        frames.push((slot / ny) as i64);
    }
    let samples = samples.finish();

    let mut fields = vec![Field::new("line", DataType::Int64, false)];
    let mut columns: Vec<Arc<dyn Array>> = vec![Arc::new(Int64Array::from(lines))];
    if nz.is_some() {
        fields.push(Field::new("frame", DataType::Int64, false));
        columns.push(Arc::new(Int64Array::from(frames)));
    }
    fields.push(Field::new("samples", samples.data_type().clone(), true));
    columns.push(Arc::new(samples));

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns).context("building record batch")?;

    let metadata = vec![
        KeyValue::new("spacing".to_string(), serde_json::to_string(signal.spacing())?),
        KeyValue::new("origin".to_string(), serde_json::to_string(signal.origin())?),
        KeyValue::new("direction".to_string(), serde_json::to_string(&signal.direction_rows())?),
    ];
    let props = WriterProperties::builder()
        .set_key_value_metadata(Some(metadata))
        .build();

    let file = std::fs::File::create(path).context("creating parquet file")?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props)).context("creating parquet writer")?;
    writer.write(&batch).context("writing batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

fn with_extension(base: &Path, ext: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(ext);
    PathBuf::from(s)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    anyhow::ensure!(cli.samples > 0 && cli.lines > 0, "samples and lines must be positive");
    let mut rng = SimpleRng::new(cli.seed);

    let depth = cli.frames.max(1);
    let mut values = Vec::with_capacity(cli.samples * cli.lines * depth);
    for frame in 0..depth {
        for line in 0..cli.lines {
            // slow lateral and elevational gain change
            let gain = 1.0 + 0.3 * ((line as f64 * 0.2) + frame as f64 * 0.5).sin();
            values.extend(rf_line(cli.samples, gain, cli.noise, &mut rng));
        }
    }

    let signal = if cli.frames == 0 {
        SignalVolume::from_parts(
            &[cli.samples, cli.lines],
            values,
            &[0.05, 0.3],
            &[0.0, 0.0],
            &[vec![1.0, 0.0], vec![0.0, 1.0]],
        )?
    } else {
        SignalVolume::from_parts(
            &[cli.samples, cli.lines, cli.frames],
            values,
            &[0.05, 0.3, 0.7],
            &[0.0, 0.0, 0.0],
            &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
        )?
    };

    if let Some(parent) = cli.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("creating output directory")?;
    }

    if matches!(cli.format, Format::Parquet | Format::Both) {
        let path = with_extension(&cli.output, ".parquet");
        write_parquet(&path, &signal)?;
        info!("wrote {}", path.display());
        println!("Wrote {:?} RF volume to {}", signal.shape(), path.display());
    }
    if matches!(cli.format, Format::Nrrd | Format::Both) {
        let path = with_extension(&cli.output, ".nrrd");
        nrrd::write_signal(&signal, &path, true)?;
        info!("wrote {}", path.display());
        println!("Wrote {:?} RF volume to {}", signal.shape(), path.display());
    }
    Ok(())
}
