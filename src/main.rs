//! rf-spectra
//!
//! Sliding-window spectra of an ultrasound RF volume, written as a Zarr
//! dataset and an NRRD image.
//!
//! # Usage
//!
//! ```bash
//! rf-spectra --input rf.parquet --output out/spectra
//! rf-spectra -i rf.nrrd -o out/spectra --fft-size 64 --step 8 --bins 2..20
//! RUST_LOG=debug rf-spectra -i rf.json -o out/spectra --config run.json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use rf_spectra::data::select::BinSelection;
use rf_spectra::spectral::{SpectrumScale, WindowType};
use rf_spectra::{CancelFlag, PipelineConfig};

#[derive(Parser)]
#[command(name = "rf-spectra")]
#[command(about = "Compute sliding-window spectra of an RF volume")]
#[command(version)]
struct Cli {
    /// Input RF volume (.nrrd, .json or .parquet)
    #[arg(short, long)]
    input: PathBuf,

    /// Output base path; `.zarr` and `.nrrd` are appended
    #[arg(short, long)]
    output: PathBuf,

    /// JSON run configuration; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Samples per analysis window
    #[arg(long)]
    fft_size: Option<usize>,

    /// Samples between consecutive windows
    #[arg(long)]
    step: Option<usize>,

    /// Neighbouring lines averaged on each side
    #[arg(long)]
    side_lines: Option<usize>,

    /// Taper applied to each window (rectangular, hann, hamming, blackman)
    #[arg(long)]
    window: Option<WindowType>,

    /// Spectrum scale (power, magnitude)
    #[arg(long)]
    scale: Option<SpectrumScale>,

    /// Keep only bins `start..end`
    #[arg(long)]
    bins: Option<BinSelection>,

    /// zstd level for the Zarr chunks
    #[arg(long)]
    compression_level: Option<i32>,

    /// Skip the Zarr dataset
    #[arg(long)]
    no_zarr: bool,

    /// Skip the NRRD image
    #[arg(long)]
    no_nrrd: bool,

    /// Transform slices one after another
    #[arg(long)]
    sequential: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(PathBuf, PathBuf, PipelineConfig)> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(v) = self.fft_size {
            config.fft_size = v;
        }
        if let Some(v) = self.step {
            config.step = v;
        }
        if let Some(v) = self.side_lines {
            config.side_lines = v;
        }
        if let Some(v) = self.window {
            config.window = v;
        }
        if let Some(v) = self.scale {
            config.scale = v;
        }
        if self.bins.is_some() {
            config.bins = self.bins;
        }
        if let Some(v) = self.compression_level {
            config.compression_level = v;
        }
        config.write_zarr &= !self.no_zarr;
        config.write_nrrd &= !self.no_nrrd;
        config.parallel &= !self.sequential;

        Ok((self.input, self.output, config))
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = cli.into_config().and_then(|(input, output, config)| {
        rf_spectra::run(&input, &output, &config, &CancelFlag::default())
    });

    match result {
        Ok(written) => {
            for path in &written {
                println!("{}", path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
