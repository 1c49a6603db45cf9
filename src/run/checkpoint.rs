//! Run-id checkpoint file.
//!
//! A single integer in a well-known file (`testrunid.txt` by default), so a
//! later invocation in the same job (a rerun of failed tests, say) reports
//! into the run this one created instead of opening a duplicate.
//!
//! The file is a one-shot handoff: read once at session start, written once
//! after the run is created. Writes go through a temp file in the same
//! directory and a rename, so a reader never sees a half-written id.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::RunId;

/// Default checkpoint file name.
pub const DEFAULT_CHECKPOINT_FILE: &str = "testrunid.txt";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Failed to access run checkpoint {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run checkpoint {} does not contain a run id: {content:?}", .path.display())]
    Invalid { path: PathBuf, content: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCheckpoint {
    path: PathBuf,
}

impl RunCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the recorded run id, or `None` if there is no checkpoint.
    ///
    /// A recorded id of `0` means "no run" and is also returned as `None`.
    pub fn load(&self) -> Result<Option<RunId>, CheckpointError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No run checkpoint at {}", self.path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let id: i64 = content
            .trim()
            .parse()
            .map_err(|_| CheckpointError::Invalid {
                path: self.path.clone(),
                content: content.clone(),
            })?;

        Ok((id != 0).then_some(RunId(id)))
    }

    /// Records `run_id`, replacing any previous checkpoint.
    pub fn store(&self, run_id: RunId) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        write!(tmp, "{}", run_id.0).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!("Saved run {} to {}", run_id, self.path.display());
        Ok(())
    }
}

impl Default for RunCheckpoint {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = TempDir::new().unwrap();
        let checkpoint = RunCheckpoint::new(dir.path().join("testrunid.txt"));
        assert_eq!(checkpoint.load().unwrap(), None);
    }

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let checkpoint = RunCheckpoint::new(dir.path().join("nested").join("testrunid.txt"));

        checkpoint.store(RunId(1384264)).unwrap();
        assert_eq!(checkpoint.load().unwrap(), Some(RunId(1384264)));

        checkpoint.store(RunId(2)).unwrap();
        assert_eq!(checkpoint.load().unwrap(), Some(RunId(2)));
        assert_eq!(std::fs::read_to_string(checkpoint.path()).unwrap(), "2");
    }

    #[test]
    fn test_tolerates_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("testrunid.txt");
        std::fs::write(&path, "42\n").unwrap();

        assert_eq!(RunCheckpoint::new(path).load().unwrap(), Some(RunId(42)));
    }

    #[test]
    fn test_zero_means_no_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("testrunid.txt");
        std::fs::write(&path, "0").unwrap();

        assert_eq!(RunCheckpoint::new(path).load().unwrap(), None);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("testrunid.txt");
        std::fs::write(&path, "not-a-number").unwrap();

        let err = RunCheckpoint::new(path).load().unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid { .. }));
    }
}
