use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result alias for the spectral pipeline.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// PipelineError – everything that can abort a run
// ---------------------------------------------------------------------------

/// Fatal pipeline failures. None of these leave partial output on disk.
///
/// A window larger than the signal is *not* an error: it produces an empty
/// set of analysis positions.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported dimensionality: {0} (expected 2 or 3)")]
    UnsupportedDimensionality(usize),

    /// Internal iteration defect: the recombined stack does not match the input.
    #[error("slice count mismatch: expected {expected} layers, got {actual}")]
    SliceCountMismatch { expected: usize, actual: usize },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed data in {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("write cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn format(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Format {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Attach the offending path to a raw `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| PipelineError::io(path, e))
    }
}
