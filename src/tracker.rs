//! The remote test-run tracking service, as seen by the reporting core.
//!
//! Everything network-bound sits behind the [`RunTracker`] trait: creating
//! runs and parent records, reporting results and rerun sub-results,
//! uploading attachments and completing the run. Transport, auth and retry
//! policy belong to the implementation.
//!
//! # Built-in Trackers
//!
//! | Tracker | Module | Description |
//! |---------|--------|-------------|
//! | Shell | [`shell`] | Delegates each call to an external command (JSON over stdin/stdout) |
//! | Memory | [`memory`] | Records calls in process; dry runs and tests |
//!
//! # Error Handling
//!
//! Calls return [`TrackerResult<T>`]. [`TrackerError::is_fatal`] separates
//! errors that should stop the consumer (bad credentials, a tracker that
//! speaks the wrong protocol) from errors that only affect one batch.

pub mod memory;
pub mod shell;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::result::{ErrorInfo, ObservedResult, TestOutcome};
use crate::run::RunMetadata;

/// Result type for tracker calls.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Errors returned by a [`RunTracker`].
///
/// - **Batch-local**: `Transient`, `Timeout`, `Rejected`, most `Io`
/// - **Fatal**: `Unauthorized`, `Protocol`, `Io` when the tracker binary is
///   missing or not executable
/// - **Cancellation**: `Aborted`, produced when a flush escalates to a hard
///   cancel while a call is in flight
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Service unavailable, throttled, or otherwise worth trying later.
    #[error("Tracker unavailable: {0}")]
    Transient(String),

    /// The call did not finish within the tracker's own timeout.
    #[error("Tracker call timed out: {0}")]
    Timeout(String),

    /// Credentials were refused.
    #[error("Tracker refused credentials: {0}")]
    Unauthorized(String),

    /// The service understood the request and refused it.
    #[error("Tracker rejected request: {0}")]
    Rejected(String),

    /// The response could not be understood.
    #[error("Tracker protocol error: {0}")]
    Protocol(String),

    /// The call was abandoned by a hard cancel.
    #[error("Tracker call aborted")]
    Aborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tracker error: {0}")]
    Other(#[from] anyhow::Error),
}

impl TrackerError {
    /// Returns `true` if retrying on the next batch cannot succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            TrackerError::Unauthorized(_) | TrackerError::Protocol(_) => true,
            TrackerError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

/// Identifier of a run on the tracking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub i64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a parent (grouping) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParentId(pub i64);

impl std::fmt::Display for ParentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a rerun sub-result under a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubResultId(pub i64);

/// First report of a test under its parent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultReport {
    pub name: String,
    pub outcome: TestOutcome,
    /// Label in the tracker's vocabulary, see [`TestOutcome::tracker_label`].
    pub outcome_label: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<ErrorInfo>,
}

impl ResultReport {
    pub fn from_result(result: &ObservedResult) -> Self {
        Self {
            name: result.name.clone(),
            outcome: result.outcome,
            outcome_label: result.outcome.tracker_label(),
            started_at: result.timing.started_at,
            finished_at: result.timing.finished_at,
            duration_ms: duration_ms(result.timing.duration),
            error: result.error.clone().filter(|e| !e.is_empty()),
        }
    }
}

/// A result reported as a sub-result of an existing parent.
///
/// Under class grouping most sub-results are simply further methods of the
/// class; only a test name reported a second time is a rerun.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerunReport {
    pub name: String,
    /// `#<attempt> <display name>` for reruns, the plain display name otherwise.
    pub display_name: String,
    pub revision: u32,
    /// How many times this test name has been reported, this one included.
    pub attempt: u32,
    pub outcome: TestOutcome,
    pub outcome_label: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<ErrorInfo>,
    /// A rerun that passed marks the test as flaky.
    pub flaky: bool,
}

impl RerunReport {
    pub fn from_result(result: &ObservedResult, revision: u32, attempt: u32) -> Self {
        Self::from_report(
            &ResultReport::from_result(result),
            result.display_name(),
            revision,
            attempt,
        )
    }

    pub fn from_report(
        report: &ResultReport,
        display_name: &str,
        revision: u32,
        attempt: u32,
    ) -> Self {
        let display_name = if attempt > 1 {
            format!("#{} {}", attempt, display_name)
        } else {
            display_name.to_string()
        };
        Self {
            name: report.name.clone(),
            display_name,
            revision,
            attempt,
            outcome: report.outcome,
            outcome_label: report.outcome_label,
            started_at: report.started_at,
            finished_at: report.finished_at,
            duration_ms: report.duration_ms,
            error: report.error.clone(),
            flaky: attempt > 1 && report.outcome == TestOutcome::Passed,
        }
    }

    /// Copies a parent-level first report as the `#1` sub-result.
    pub fn first_attempt_copy(report: &ResultReport, display_name: &str) -> Self {
        let mut copy = Self::from_report(report, display_name, 0, 1);
        copy.display_name = format!("#1 {}", display_name);
        copy
    }
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Category of an uploaded attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentKind {
    General,
    CodeCoverage,
}

impl AttachmentKind {
    /// ```
    /// use runfeed::tracker::AttachmentKind;
    ///
    /// assert_eq!(AttachmentKind::for_file_name("run.COVERAGE"), AttachmentKind::CodeCoverage);
    /// assert_eq!(AttachmentKind::for_file_name("log.txt"), AttachmentKind::General);
    /// ```
    pub fn for_file_name(file_name: &str) -> Self {
        if file_name.to_ascii_lowercase().ends_with(".coverage") {
            AttachmentKind::CodeCoverage
        } else {
            AttachmentKind::General
        }
    }
}

/// Where an attachment is uploaded: the run, a parent, or a sub-result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentTarget {
    pub parent_id: Option<ParentId>,
    pub sub_result_id: Option<SubResultId>,
}

impl AttachmentTarget {
    pub fn run() -> Self {
        Self::default()
    }

    pub fn parent(parent_id: ParentId) -> Self {
        Self {
            parent_id: Some(parent_id),
            sub_result_id: None,
        }
    }

    pub fn sub_result(parent_id: ParentId, sub_result_id: SubResultId) -> Self {
        Self {
            parent_id: Some(parent_id),
            sub_result_id: Some(sub_result_id),
        }
    }
}

/// Bytes and metadata of one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub kind: AttachmentKind,
    pub comment: Option<String>,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    pub fn text(file_name: impl Into<String>, text: &str) -> Self {
        let file_name = file_name.into();
        Self {
            kind: AttachmentKind::for_file_name(&file_name),
            file_name,
            comment: None,
            bytes: text.as_bytes().to_vec(),
        }
    }

    /// Reads a file from disk.
    pub async fn from_file(path: &Path, comment: Option<&str>) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Ok(Self {
            kind: AttachmentKind::for_file_name(&file_name),
            file_name,
            comment: comment.map(str::to_string),
            bytes,
        })
    }
}

/// Capability to talk to the remote tracking service.
///
/// Implementations must be `Send + Sync`; one instance is shared between
/// the consumer task and the flush coordinator.
#[async_trait]
pub trait RunTracker: Send + Sync {
    /// Tracker name, for logging.
    fn name(&self) -> &str;

    /// Creates a run and returns its id.
    async fn create_run(&self, metadata: &RunMetadata) -> TrackerResult<RunId>;

    /// Creates one parent record per key in a single call.
    ///
    /// An empty `keys` slice is a no-op returning an empty map. Keys missing
    /// from the returned map were not created.
    async fn create_parents(
        &self,
        run_id: RunId,
        keys: &[String],
        started_at: DateTime<Utc>,
        source: Option<&str>,
    ) -> TrackerResult<HashMap<String, ParentId>>;

    /// Reports the first result under a parent.
    async fn report_result(
        &self,
        run_id: RunId,
        parent_id: ParentId,
        report: &ResultReport,
    ) -> TrackerResult<()>;

    /// Reports a further attempt as a sub-result and returns its id.
    async fn report_rerun_result(
        &self,
        run_id: RunId,
        parent_id: ParentId,
        report: &RerunReport,
    ) -> TrackerResult<SubResultId>;

    async fn upload_attachment(
        &self,
        run_id: RunId,
        target: AttachmentTarget,
        upload: &AttachmentUpload,
    ) -> TrackerResult<()>;

    /// Marks the run completed, or aborted.
    async fn complete_run(
        &self,
        run_id: RunId,
        aborted: bool,
        completed_at: DateTime<Utc>,
    ) -> TrackerResult<()>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::result::ObservedResult;

    #[test]
    fn test_fatal_classification() {
        assert!(TrackerError::Unauthorized("401".into()).is_fatal());
        assert!(TrackerError::Protocol("garbage".into()).is_fatal());
        assert!(TrackerError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_fatal());
        assert!(!TrackerError::Transient("503".into()).is_fatal());
        assert!(!TrackerError::Timeout("slow".into()).is_fatal());
        assert!(!TrackerError::Rejected("400".into()).is_fatal());
        assert!(!TrackerError::Aborted.is_fatal());
    }

    #[test]
    fn test_rerun_report_naming_and_flakiness() {
        let passed = ObservedResult::new("Ns.Class.Method", TestOutcome::Passed);
        let rerun = RerunReport::from_result(&passed, 1, 2);
        assert_eq!(rerun.display_name, "#2 Method");
        assert!(rerun.flaky);

        let failed = ObservedResult::new("Ns.Class.Method", TestOutcome::Failed);
        assert!(!RerunReport::from_result(&failed, 2, 3).flaky);
    }

    #[test]
    fn test_sibling_method_is_not_a_rerun() {
        let passed = ObservedResult::new("Ns.Class.Other", TestOutcome::Passed);
        let sibling = RerunReport::from_result(&passed, 3, 1);
        assert_eq!(sibling.display_name, "Other");
        assert_eq!(sibling.revision, 3);
        assert!(!sibling.flaky);
    }

    #[test]
    fn test_first_attempt_copy_is_numbered() {
        let failed = ObservedResult::new("Ns.Class.Method", TestOutcome::Failed);
        let copy = RerunReport::first_attempt_copy(&ResultReport::from_result(&failed), "Method");
        assert_eq!(copy.display_name, "#1 Method");
        assert_eq!((copy.revision, copy.attempt), (0, 1));
        assert!(!copy.flaky);
    }

    #[test]
    fn test_result_report_drops_empty_error() {
        let mut result = ObservedResult::new("a.b", TestOutcome::Failed)
            .with_duration(Duration::from_millis(1234));
        result.error = Some(ErrorInfo::default());

        let report = ResultReport::from_result(&result);
        assert_eq!(report.error, None);
        assert_eq!(report.duration_ms, 1234);
        assert_eq!(report.outcome_label, "Failed");
    }

    #[tokio::test]
    async fn test_upload_from_file_uses_file_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.coverage");
        std::fs::write(&path, b"data").unwrap();

        let upload = AttachmentUpload::from_file(&path, Some("cov")).await.unwrap();
        assert_eq!(upload.file_name, "run.coverage");
        assert_eq!(upload.kind, AttachmentKind::CodeCoverage);
        assert_eq!(upload.comment.as_deref(), Some("cov"));
        assert_eq!(upload.bytes, b"data");
    }
}
