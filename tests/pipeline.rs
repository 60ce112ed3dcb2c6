use std::path::{Path, PathBuf};

use approx::assert_relative_eq;
use ndarray::Axis;
use serde_json::json;
use tempfile::tempdir;

use rf_spectra::data::select::BinSelection;
use rf_spectra::persist::{nrrd, ZarrDataset};
use rf_spectra::{CancelFlag, PipelineConfig, SignalVolume, SpectralVolume};

/// RF input as a JSON file; `sizes` fastest first, samples `x` fastest.
fn write_input(dir: &Path, sizes: &[usize]) -> PathBuf {
    let count: usize = sizes.iter().product();
    let samples: Vec<f32> = (0..count)
        .map(|i| {
            let x = (i % sizes[0]) as f32;
            let rest = (i / sizes[0]) as f32;
            (x * 0.8).sin() + 0.1 * (rest * 1.3).cos()
        })
        .collect();
    let dim = sizes.len();
    let spacing: Vec<f64> = [0.05, 0.3, 0.7][..dim].to_vec();
    let origin: Vec<f64> = [1.0, -2.0, 4.5][..dim].to_vec();
    let direction: Vec<Vec<f64>> = (0..dim)
        .map(|r| (0..dim).map(|c| if r == c { 1.0 } else { 0.0 }).collect())
        .collect();

    let path = dir.join(format!("rf_{dim}d_{}.json", sizes.iter().product::<usize>()));
    let doc = json!({
        "sizes": sizes,
        "spacing": spacing,
        "origin": origin,
        "direction": direction,
        "samples": samples,
    });
    std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
    path
}

fn run(input: &Path, output: &Path, config: &PipelineConfig) -> Vec<PathBuf> {
    rf_spectra::run(input, output, config, &CancelFlag::default()).unwrap()
}

fn expected(input: &Path, config: &PipelineConfig) -> SpectralVolume {
    let signal = rf_spectra::data::loader::load_file(input).unwrap();
    rf_spectra::compute(&signal, config).unwrap()
}

#[test]
fn plane_scenario_writes_both_artifacts() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), &[64, 8]);
    let output = dir.path().join("out/spectra");
    let config = PipelineConfig::default();

    let written = run(&input, &output, &config);
    assert_eq!(
        written,
        vec![dir.path().join("out/spectra.zarr"), dir.path().join("out/spectra.nrrd")]
    );

    let dataset = ZarrDataset::open(&written[0]).unwrap();
    assert_eq!(dataset.dims(), ["y", "x", "c"]);
    assert_eq!(dataset.shape(), [8, 9, 17]);
    assert_eq!(dataset.bins().unwrap(), (0..17).collect::<Vec<i64>>());

    let x = dataset.coordinate("x").unwrap();
    assert_eq!(x.len(), 9);
    // first window centre sits 16 samples into the line; positions are 4 samples apart
    assert_relative_eq!(x[0], 1.0 + 16.0 * 0.05, epsilon = 1e-12);
    assert_relative_eq!(x[1] - x[0], 4.0 * 0.05, epsilon = 1e-12);

    let reference = expected(&input, &config);
    assert_eq!(dataset.read().unwrap(), reference);
    assert_eq!(nrrd::read_spectral(&written[1]).unwrap(), reference);
}

#[test]
fn volume_scenario_round_trips() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), &[64, 8, 5]);
    let output = dir.path().join("spectra");
    let config = PipelineConfig::default();

    let written = run(&input, &output, &config);
    let dataset = ZarrDataset::open(&written[0]).unwrap();
    assert_eq!(dataset.dims(), ["z", "y", "x", "c"]);
    assert_eq!(dataset.shape(), [5, 8, 9, 17]);
    assert_eq!(dataset.num_layers(), 5);

    let z = dataset.coordinate("z").unwrap();
    let expected_z: Vec<f64> = (0..5).map(|k| 4.5 + k as f64 * 0.7).collect();
    assert_eq!(z, expected_z);
    assert_eq!(dataset.attrs().direction[2], vec![0.0, 0.0, 1.0]);

    let reference = expected(&input, &config);
    assert_eq!(reference.shape(), vec![9, 8, 5, 17]);
    assert_eq!(dataset.read().unwrap(), reference);
    assert_eq!(nrrd::read_spectral(&written[1]).unwrap(), reference);

    let SpectralVolume::Volume(stack) = &reference else {
        panic!("expected a volume");
    };
    for k in [0, 4] {
        assert_eq!(dataset.read_layer(k).unwrap(), stack.data.index_axis(Axis(2), k));
    }
}

#[test]
fn overwrite_leaves_no_residual_chunks() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("spectra");
    let config = PipelineConfig::default();

    run(&write_input(dir.path(), &[64, 8, 16]), &output, &config);
    let store = dir.path().join("spectra.zarr");
    assert!(store.join("spectra/15.0.0.0").exists());

    run(&write_input(dir.path(), &[64, 8, 2]), &output, &config);
    assert!(store.join("spectra/1.0.0.0").exists());
    assert!(!store.join("spectra/2.0.0.0").exists());
    assert!(!store.join("spectra/15.0.0.0").exists());

    let dataset = ZarrDataset::open(&store).unwrap();
    assert_eq!(dataset.shape(), [2, 8, 9, 17]);
    assert_eq!(dataset.coordinate("z").unwrap().len(), 2);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".partial-"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn bin_selection_keeps_original_labels() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), &[64, 8, 3]);
    let output = dir.path().join("spectra");
    let config = PipelineConfig {
        bins: Some(BinSelection { start: 2, end: 10 }),
        ..Default::default()
    };

    let written = run(&input, &output, &config);
    let dataset = ZarrDataset::open(&written[0]).unwrap();
    assert_eq!(dataset.shape(), [3, 8, 9, 8]);
    assert_eq!(dataset.bins().unwrap(), (2..10).collect::<Vec<i64>>());

    let nrrd_volume = nrrd::read_spectral(&written[1]).unwrap();
    assert_eq!(nrrd_volume.bins(), (2..10).collect::<Vec<i64>>().as_slice());
}

#[test]
fn disabled_artifact_is_not_written() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), &[64, 8]);
    let output = dir.path().join("spectra");
    let config = PipelineConfig {
        write_nrrd: false,
        ..Default::default()
    };

    let written = run(&input, &output, &config);
    assert_eq!(written, vec![dir.path().join("spectra.zarr")]);
    assert!(!dir.path().join("spectra.nrrd").exists());
}

#[test]
fn signal_shorter_than_window_gives_empty_positions() {
    let dir = tempdir().unwrap();
    let input = write_input(dir.path(), &[16, 4, 3]);
    let output = dir.path().join("spectra");

    let written = run(&input, &output, &PipelineConfig::default());
    let dataset = ZarrDataset::open(&written[0]).unwrap();
    assert_eq!(dataset.shape(), [3, 4, 0, 17]);
    assert_eq!(dataset.coordinate("z").unwrap().len(), 3);
}

#[test]
fn invalid_input_writes_nothing() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("rf.json");
    std::fs::write(&input, r#"{ "sizes": [4, 1, 1, 1], "samples": [0, 1, 2, 3] }"#).unwrap();
    let output = dir.path().join("spectra");

    let err = rf_spectra::run(&input, &output, &PipelineConfig::default(), &CancelFlag::default())
        .unwrap_err();
    assert!(format!("{err:#}").contains("unsupported dimensionality"), "{err:#}");
    assert!(!dir.path().join("spectra.zarr").exists());
    assert!(!dir.path().join("spectra.nrrd").exists());
}

#[test]
fn sinusoid_peaks_at_its_bin() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("tone.json");
    // 4 cycles per 32-sample window
    let samples: Vec<f32> = (0..64 * 2)
        .map(|i| (2.0 * std::f32::consts::PI * 4.0 * (i % 64) as f32 / 32.0).sin())
        .collect();
    std::fs::write(
        &input,
        serde_json::to_vec(&json!({ "sizes": [64, 2], "samples": samples })).unwrap(),
    )
    .unwrap();

    let signal = rf_spectra::data::loader::load_file(&input).unwrap();
    assert!(matches!(signal, SignalVolume::Plane(_)));
    let SpectralVolume::Plane(slice) = rf_spectra::compute(&signal, &PipelineConfig::default()).unwrap()
    else {
        panic!("expected a plane");
    };
    for spectrum in slice.data.lanes(Axis(2)) {
        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(b, _)| b);
        assert_eq!(peak, Some(4));
    }
}
