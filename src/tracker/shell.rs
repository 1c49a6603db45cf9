//! Tracker that shells out to an external command.
//!
//! This lets the tracking service client be written in any language.
//!
//! # Protocol
//!
//! Every tracker call runs the configured command once with the operation
//! name appended:
//!
//! ```bash
//! <command> create-run | create-parents | report-result | report-rerun
//!           | upload-attachment | complete-run
//! ```
//!
//! The request is written to stdin as a single JSON object. The response is
//! the last line of stdout that starts with `{`:
//!
//! | Operation | Response |
//! |-----------|----------|
//! | `create-run` | `{"run_id": 17}` |
//! | `create-parents` | `{"parents": {"BarTests": 4}}` |
//! | `report-rerun` | `{"sub_result_id": 9}` |
//! | others | ignored |
//!
//! Exit codes: `0` success, `75` try again later, `77` credentials refused,
//! anything else the request was rejected. Attachment bytes are not sent
//! inline; the request carries the `path` of a temporary file holding them,
//! valid until the command exits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{
    AttachmentKind, AttachmentTarget, AttachmentUpload, ParentId, RerunReport, ResultReport,
    RunId, RunTracker, SubResultId, TrackerError, TrackerResult,
};
use crate::run::RunMetadata;

/// Exit code asking the caller to try again later (`EX_TEMPFAIL`).
pub const EXIT_TRANSIENT: i32 = 75;

/// Exit code for refused credentials (`EX_NOPERM`).
pub const EXIT_UNAUTHORIZED: i32 = 77;

/// A tracker implemented by an external command.
pub struct ShellTracker {
    /// The base command to run (e.g. "python3 tracker.py")
    command: String,
    working_dir: Option<PathBuf>,
    /// Per-call timeout in seconds
    timeout_secs: u64,
}

#[derive(Serialize)]
struct CreateRunRequest<'a> {
    run: &'a RunMetadata,
}

#[derive(Serialize)]
struct CreateParentsRequest<'a> {
    run_id: RunId,
    keys: &'a [String],
    started_at: DateTime<Utc>,
    source: Option<&'a str>,
}

#[derive(Serialize)]
struct ReportRequest<'a, R> {
    run_id: RunId,
    parent_id: ParentId,
    result: &'a R,
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    run_id: RunId,
    parent_id: Option<ParentId>,
    sub_result_id: Option<SubResultId>,
    file_name: &'a str,
    kind: AttachmentKind,
    comment: Option<&'a str>,
    path: PathBuf,
}

#[derive(Serialize)]
struct CompleteRunRequest {
    run_id: RunId,
    aborted: bool,
    completed_at: DateTime<Utc>,
}

impl ShellTracker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            timeout_secs: 120,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn command_parts(&self) -> Vec<String> {
        // Split command string into parts, respecting quotes
        shell_words::split(&self.command).unwrap_or_else(|_| vec![self.command.clone()])
    }

    /// Runs one operation and returns the parsed response line, if any.
    async fn invoke<R: Serialize + Sync>(
        &self,
        operation: &str,
        request: &R,
    ) -> TrackerResult<Option<Value>> {
        let mut parts = self.command_parts();
        if parts.is_empty() {
            return Err(TrackerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tracker command is empty",
            )));
        }
        parts.push(operation.to_string());

        let payload = serde_json::to_vec(request)
            .map_err(|e| TrackerError::Protocol(format!("Failed to encode request: {}", e)))?;

        debug!("Running tracker: {:?}", parts);

        let mut cmd = tokio::process::Command::new(&parts[0]);
        cmd.args(&parts[1..]);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // A timed-out or cancelled call must not leave the command running.
        cmd.kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let exchange = async {
            let mut child = cmd.spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(&payload).await {
                    Ok(()) => {}
                    // The command may answer without reading its request.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e),
                }
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), exchange)
            .await
            .map_err(|_| {
                TrackerError::Timeout(format!(
                    "{} did not finish within {}s",
                    operation, self.timeout_secs
                ))
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = || {
            let msg = stderr.trim();
            if msg.is_empty() {
                format!("{} exited with {}", operation, output.status)
            } else {
                format!("{}: {}", operation, msg)
            }
        };

        match output.status.code() {
            Some(0) => {}
            Some(EXIT_TRANSIENT) => return Err(TrackerError::Transient(detail())),
            Some(EXIT_UNAUTHORIZED) => return Err(TrackerError::Unauthorized(detail())),
            // Killed by a signal.
            None => return Err(TrackerError::Transient(detail())),
            Some(_) => return Err(TrackerError::Rejected(detail())),
        }

        if !stderr.trim().is_empty() {
            debug!("Tracker stderr for {}: {}", operation, stderr.trim());
        }

        // Look for the last line that looks like JSON
        let Some(line) = stdout
            .lines()
            .rev()
            .find(|line| line.trim().starts_with('{'))
        else {
            return Ok(None);
        };

        serde_json::from_str(line.trim())
            .map(Some)
            .map_err(|e| TrackerError::Protocol(format!("{}: invalid response: {}", operation, e)))
    }

    fn field<T: DeserializeOwned>(
        operation: &str,
        response: Option<Value>,
        field: &str,
    ) -> TrackerResult<T> {
        let value = response
            .and_then(|mut v| v.get_mut(field).map(Value::take))
            .ok_or_else(|| {
                TrackerError::Protocol(format!("{}: response has no '{}'", operation, field))
            })?;
        serde_json::from_value(value).map_err(|e| {
            TrackerError::Protocol(format!("{}: invalid '{}': {}", operation, field, e))
        })
    }
}

#[async_trait]
impl RunTracker for ShellTracker {
    fn name(&self) -> &str {
        "shell"
    }

    async fn create_run(&self, metadata: &RunMetadata) -> TrackerResult<RunId> {
        let response = self
            .invoke("create-run", &CreateRunRequest { run: metadata })
            .await?;
        Self::field("create-run", response, "run_id")
    }

    async fn create_parents(
        &self,
        run_id: RunId,
        keys: &[String],
        started_at: DateTime<Utc>,
        source: Option<&str>,
    ) -> TrackerResult<HashMap<String, ParentId>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let request = CreateParentsRequest {
            run_id,
            keys,
            started_at,
            source,
        };
        let response = self.invoke("create-parents", &request).await?;
        Self::field("create-parents", response, "parents")
    }

    async fn report_result(
        &self,
        run_id: RunId,
        parent_id: ParentId,
        report: &ResultReport,
    ) -> TrackerResult<()> {
        let request = ReportRequest {
            run_id,
            parent_id,
            result: report,
        };
        self.invoke("report-result", &request).await?;
        Ok(())
    }

    async fn report_rerun_result(
        &self,
        run_id: RunId,
        parent_id: ParentId,
        report: &RerunReport,
    ) -> TrackerResult<SubResultId> {
        let request = ReportRequest {
            run_id,
            parent_id,
            result: report,
        };
        let response = self.invoke("report-rerun", &request).await?;
        Self::field("report-rerun", response, "sub_result_id")
    }

    async fn upload_attachment(
        &self,
        run_id: RunId,
        target: AttachmentTarget,
        upload: &AttachmentUpload,
    ) -> TrackerResult<()> {
        // Lives until the command has exited.
        let staged = tempfile::Builder::new()
            .prefix("runfeed-attachment-")
            .tempfile()?;
        tokio::fs::write(staged.path(), &upload.bytes).await?;

        let request = UploadRequest {
            run_id,
            parent_id: target.parent_id,
            sub_result_id: target.sub_result_id,
            file_name: &upload.file_name,
            kind: upload.kind,
            comment: upload.comment.as_deref(),
            path: staged.path().to_path_buf(),
        };
        let outcome = self.invoke("upload-attachment", &request).await;

        if let Err(e) = staged.close() {
            warn!("Failed to remove staged attachment: {}", e);
        }
        outcome.map(|_| ())
    }

    async fn complete_run(
        &self,
        run_id: RunId,
        aborted: bool,
        completed_at: DateTime<Utc>,
    ) -> TrackerResult<()> {
        let request = CompleteRunRequest {
            run_id,
            aborted,
            completed_at,
        };
        self.invoke("complete-run", &request).await?;
        Ok(())
    }
}
