/// Persistence of a Spectral Volume.
///
/// ```text
///   SpectralVolume
///        │
///        ├──────────────┐
///        ▼              ▼
///   ┌─────────┐    ┌─────────┐
///   │  zarr   │    │  nrrd   │   staged side by side, in parallel
///   └─────────┘    └─────────┘
///        │              │
///        └──────┬───────┘
///               ▼
///      commit: rename both into place, or remove both
/// ```

pub mod nrrd;
pub mod zarr;

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use rayon::prelude::*;

use crate::data::model::SpectralVolume;
use crate::error::{IoContext, PipelineError, Result};

pub use zarr::ZarrDataset;

// ---------------------------------------------------------------------------
// CancelFlag
// ---------------------------------------------------------------------------

/// Cooperative cancellation shared between the host and the writers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// The two output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// Chunked Zarr dataset, zstd at `level`.
    Zarr { level: i32 },
    /// Single-file NRRD image.
    Nrrd { gzip: bool },
}

impl Artifact {
    pub fn extension(&self) -> &'static str {
        match self {
            Artifact::Zarr { .. } => ".zarr",
            Artifact::Nrrd { .. } => ".nrrd",
        }
    }

    /// Final location for the output base path `output` (no extension).
    pub fn target(&self, output: &Path) -> PathBuf {
        with_suffix(output, self.extension())
    }

    fn write(&self, volume: &SpectralVolume, path: &Path, cancel: &CancelFlag) -> Result<()> {
        match *self {
            Artifact::Zarr { level } => zarr::write_zarr(volume, path, level, cancel),
            Artifact::Nrrd { gzip } => nrrd::write_spectral(volume, path, gzip, cancel),
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(base.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// Remove a file or directory tree if present.
fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).at(path),
        Ok(_) => fs::remove_file(path).at(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

// ---------------------------------------------------------------------------
// DatasetPersister
// ---------------------------------------------------------------------------

/// Writes every configured artifact for one Spectral Volume.
///
/// Both artifacts are written to staging paths first; targets are replaced
/// only once every staged write succeeded. Existing targets are moved aside
/// to `<target>.old-<pid>` during the commit and deleted after it, never
/// merged. A failed commit restores them.
#[derive(Debug, Clone, Default)]
pub struct DatasetPersister {
    artifacts: Vec<Artifact>,
    cancel: CancelFlag,
}

impl DatasetPersister {
    pub fn new(artifacts: Vec<Artifact>) -> Self {
        Self {
            artifacts,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Write all artifacts for `output` (base path without extension).
    /// Returns the final paths.
    pub fn persist(&self, volume: &SpectralVolume, output: &Path) -> Result<Vec<PathBuf>> {
        if self.artifacts.is_empty() {
            warn!("no output artifacts enabled, nothing written");
            return Ok(Vec::new());
        }
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).at(parent)?;
        }

        let suffix = format!(".partial-{}", std::process::id());
        let plan: Vec<(Artifact, PathBuf, PathBuf)> = self
            .artifacts
            .iter()
            .map(|a| {
                let target = a.target(output);
                let staged = with_suffix(&target, &suffix);
                (*a, target, staged)
            })
            .collect();

        let staged: Result<Vec<()>> = plan
            .par_iter()
            .map(|(artifact, _, staged)| {
                remove_path(staged)?;
                artifact.write(volume, staged, &self.cancel)
            })
            .collect();

        if let Err(e) = staged {
            discard_staged(&plan);
            return Err(e);
        }

        let mut commit = Commit::default();
        for (_, target, staged) in &plan {
            if let Err(e) = commit.swap_in(target, staged) {
                commit.roll_back();
                discard_staged(&plan);
                return Err(e);
            }
        }
        commit.finish();

        let written: Vec<PathBuf> = plan.into_iter().map(|(_, target, _)| target).collect();
        for target in &written {
            info!("wrote {}", target.display());
        }
        Ok(written)
    }
}

fn discard_staged(plan: &[(Artifact, PathBuf, PathBuf)]) {
    for (_, _, staged) in plan {
        if let Err(e) = remove_path(staged) {
            warn!("could not remove staged output: {e}");
        }
    }
}

/// Renames done while committing, so a failed commit can be undone.
#[derive(Debug, Default)]
struct Commit {
    /// Previous targets moved aside: `(target, aside)`.
    set_aside: Vec<(PathBuf, PathBuf)>,
    /// Staged outputs moved into place: `(target, staged)`.
    swapped_in: Vec<(PathBuf, PathBuf)>,
}

impl Commit {
    fn swap_in(&mut self, target: &Path, staged: &Path) -> Result<()> {
        if fs::symlink_metadata(target).is_ok() {
            let aside = with_suffix(target, &format!(".old-{}", std::process::id()));
            fs::rename(target, &aside).at(target)?;
            self.set_aside.push((target.to_path_buf(), aside));
        }
        fs::rename(staged, target).at(target)?;
        self.swapped_in.push((target.to_path_buf(), staged.to_path_buf()));
        Ok(())
    }

    /// Put the new outputs back to staging and the previous ones in place.
    fn roll_back(self) {
        for (target, staged) in self.swapped_in.iter().rev() {
            if let Err(e) = fs::rename(target, staged) {
                warn!("could not withdraw {}: {e}", target.display());
            }
        }
        for (target, aside) in self.set_aside.iter().rev() {
            if let Err(e) = fs::rename(aside, target) {
                warn!("could not restore {} from {}: {e}", target.display(), aside.display());
            }
        }
    }

    /// Drop the previous outputs once every new one is in place.
    fn finish(self) {
        for (_, aside) in &self.set_aside {
            if let Err(e) = remove_path(aside) {
                warn!("could not remove previous output: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{Geometry3, SpectralStack};
    use crate::spectral::SpectralParams;
    use ndarray::Array4;
    use tempfile::tempdir;

    fn volume(depth: usize) -> SpectralVolume {
        SpectralVolume::Volume(SpectralStack {
            data: Array4::from_elem((2, 2, depth, 3), 1.5),
            geometry: Geometry3::default(),
            z: (0..depth).map(|k| k as f64).collect(),
            bins: (0..3).collect(),
            params: SpectralParams::default(),
        })
    }

    fn both() -> Vec<Artifact> {
        vec![Artifact::Zarr { level: 3 }, Artifact::Nrrd { gzip: true }]
    }

    #[test]
    fn writes_both_and_leaves_no_staging() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("nested/spectra");
        let written = DatasetPersister::new(both()).persist(&volume(2), &output).unwrap();

        assert_eq!(written, vec![dir.path().join("nested/spectra.zarr"), dir.path().join("nested/spectra.nrrd")]);
        let names: Vec<String> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "{names:?}");
    }

    #[test]
    fn cancelled_persist_writes_nothing() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("spectra");
        let cancel = CancelFlag::default();
        cancel.cancel();
        let err = DatasetPersister::new(both())
            .with_cancel(cancel)
            .persist(&volume(2), &output)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancelled_persist_keeps_previous_outputs() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("spectra");
        DatasetPersister::new(both()).persist(&volume(2), &output).unwrap();
        let previous = fs::read(dir.path().join("spectra.nrrd")).unwrap();

        let cancel = CancelFlag::default();
        cancel.cancel();
        assert!(DatasetPersister::new(both())
            .with_cancel(cancel)
            .persist(&volume(5), &output)
            .is_err());

        assert_eq!(fs::read(dir.path().join("spectra.nrrd")).unwrap(), previous);
        let dataset = ZarrDataset::open(&dir.path().join("spectra.zarr")).unwrap();
        assert_eq!(dataset.num_layers(), 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn overwrite_replaces_and_drops_previous_outputs() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("spectra");
        DatasetPersister::new(both()).persist(&volume(2), &output).unwrap();
        DatasetPersister::new(both()).persist(&volume(5), &output).unwrap();

        assert_eq!(entries(dir.path()), ["spectra.nrrd", "spectra.zarr"]);
        let dataset = ZarrDataset::open(&dir.path().join("spectra.zarr")).unwrap();
        assert_eq!(dataset.num_layers(), 5);
    }

    #[test]
    fn failed_commit_restores_previous_outputs() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("spectra");
        DatasetPersister::new(both()).persist(&volume(2), &output).unwrap();
        let previous = fs::read(dir.path().join("spectra.nrrd")).unwrap();

        // the NRRD cannot be moved aside: its commit fails after the Zarr one
        let aside = format!("spectra.nrrd.old-{}", std::process::id());
        fs::create_dir_all(dir.path().join(&aside).join("occupied")).unwrap();

        let err = DatasetPersister::new(both())
            .persist(&volume(5), &output)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }), "{err}");

        let dataset = ZarrDataset::open(&dir.path().join("spectra.zarr")).unwrap();
        assert_eq!(dataset.num_layers(), 2);
        assert_eq!(fs::read(dir.path().join("spectra.nrrd")).unwrap(), previous);
        assert_eq!(entries(dir.path()), vec!["spectra.nrrd".to_string(), aside, "spectra.zarr".to_string()]);
    }

    #[test]
    fn one_failed_artifact_discards_the_other() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("spectra");
        DatasetPersister::new(both()).persist(&volume(2), &output).unwrap();
        let previous = fs::read(dir.path().join("spectra.nrrd")).unwrap();

        let err = DatasetPersister::new(vec![Artifact::Zarr { level: 0 }, Artifact::Nrrd { gzip: true }])
            .persist(&volume(5), &output)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { .. }), "{err}");

        assert_eq!(fs::read(dir.path().join("spectra.nrrd")).unwrap(), previous);
        let dataset = ZarrDataset::open(&dir.path().join("spectra.zarr")).unwrap();
        assert_eq!(dataset.num_layers(), 2);
        assert_eq!(entries(dir.path()), ["spectra.nrrd", "spectra.zarr"]);
    }
}
