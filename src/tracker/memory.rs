//! In-process tracker that records every call.
//!
//! Used for `--dry-run` (with call logging switched on) and as the test
//! double for the reporting core. Faults can be injected per operation:
//! a number of failing calls, added latency, or a stall that never returns,
//! which is how a hung tracking service is simulated.
//!
//! ```
//! use runfeed::tracker::TrackerError;
//! use runfeed::tracker::memory::{MemoryTracker, Op};
//!
//! let tracker = MemoryTracker::new();
//! tracker.fail_next(Op::CreateParents, 1, || TrackerError::Transient("503".into()));
//! tracker.stall(Op::CompleteRun);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{
    AttachmentKind, AttachmentTarget, AttachmentUpload, ParentId, RerunReport, ResultReport,
    RunId, RunTracker, SubResultId, TrackerError, TrackerResult,
};
use crate::run::RunMetadata;

/// Tracker operations, for targeting faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreateRun,
    CreateParents,
    ReportResult,
    ReportRerun,
    UploadAttachment,
    CompleteRun,
}

/// A successful call, as recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerCall {
    CreateRun {
        name: String,
    },
    CreateParents {
        run_id: RunId,
        keys: Vec<String>,
        source: Option<String>,
    },
    ReportResult {
        run_id: RunId,
        parent_id: ParentId,
        report: ResultReport,
    },
    ReportRerun {
        run_id: RunId,
        parent_id: ParentId,
        sub_result_id: SubResultId,
        report: RerunReport,
    },
    UploadAttachment {
        run_id: RunId,
        target: AttachmentTarget,
        file_name: String,
        kind: AttachmentKind,
        bytes: Vec<u8>,
    },
    CompleteRun {
        run_id: RunId,
        aborted: bool,
    },
}

impl TrackerCall {
    fn summary(&self) -> String {
        match self {
            TrackerCall::CreateRun { name } => format!("create run '{}'", name),
            TrackerCall::CreateParents { run_id, keys, .. } => {
                format!("run {}: create {} parent(s): {}", run_id, keys.len(), keys.join(", "))
            }
            TrackerCall::ReportResult {
                run_id,
                parent_id,
                report,
            } => format!(
                "run {}: {} {} under parent {}",
                run_id, report.outcome_label, report.name, parent_id
            ),
            TrackerCall::ReportRerun {
                run_id,
                parent_id,
                report,
                ..
            } => format!(
                "run {}: {} {} (revision {}) under parent {}",
                run_id, report.outcome_label, report.display_name, report.revision, parent_id
            ),
            TrackerCall::UploadAttachment {
                run_id,
                file_name,
                bytes,
                ..
            } => format!("run {}: attach {} ({} bytes)", run_id, file_name, bytes.len()),
            TrackerCall::CompleteRun { run_id, aborted } => {
                let state = if *aborted { "aborted" } else { "completed" };
                format!("run {}: mark {}", run_id, state)
            }
        }
    }
}

type ErrorFactory = Box<dyn Fn() -> TrackerError + Send + Sync>;

struct Fault {
    op: Option<Op>,
    remaining: usize,
    make: ErrorFactory,
}

#[derive(Default)]
struct Recorder {
    calls: Vec<TrackerCall>,
    failed: Vec<Op>,
    faults: Vec<Fault>,
    stalled: Vec<Op>,
}

/// Tracker that keeps everything in memory.
pub struct MemoryTracker {
    name: String,
    next_id: AtomicI64,
    latency: Duration,
    log_calls: bool,
    recorder: Mutex<Recorder>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            next_id: AtomicI64::new(1),
            latency: Duration::ZERO,
            log_calls: false,
            recorder: Mutex::new(Recorder::default()),
        }
    }

    /// Dry-run tracker: logs each call at info level.
    pub fn logging() -> Self {
        Self {
            name: "dry-run".to_string(),
            log_calls: true,
            ..Self::new()
        }
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fails the next `count` calls of any operation.
    pub fn fail_next_calls(
        &self,
        count: usize,
        make: impl Fn() -> TrackerError + Send + Sync + 'static,
    ) {
        self.lock().faults.push(Fault {
            op: None,
            remaining: count,
            make: Box::new(make),
        });
    }

    /// Fails the next `count` calls of `op`.
    pub fn fail_next(
        &self,
        op: Op,
        count: usize,
        make: impl Fn() -> TrackerError + Send + Sync + 'static,
    ) {
        self.lock().faults.push(Fault {
            op: Some(op),
            remaining: count,
            make: Box::new(make),
        });
    }

    /// Makes every later call of `op` hang forever.
    pub fn stall(&self, op: Op) {
        self.lock().stalled.push(op);
    }

    /// Lets calls of `op` through again.
    pub fn resume(&self, op: Op) {
        self.lock().stalled.retain(|o| *o != op);
    }

    /// Successful calls, in order.
    pub fn calls(&self) -> Vec<TrackerCall> {
        self.lock().calls.clone()
    }

    /// Operations that returned an injected error, in order.
    pub fn failed_calls(&self) -> Vec<Op> {
        self.lock().failed.clone()
    }

    /// Key lists of successful parent creations, one entry per call.
    pub fn parent_batches(&self) -> Vec<Vec<String>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TrackerCall::CreateParents { keys, .. } => Some(keys.clone()),
                _ => None,
            })
            .collect()
    }

    /// First reports, in order.
    pub fn results(&self) -> Vec<(ParentId, ResultReport)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TrackerCall::ReportResult {
                    parent_id, report, ..
                } => Some((*parent_id, report.clone())),
                _ => None,
            })
            .collect()
    }

    /// Rerun sub-results, in order.
    pub fn reruns(&self) -> Vec<(ParentId, RerunReport)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TrackerCall::ReportRerun {
                    parent_id, report, ..
                } => Some((*parent_id, report.clone())),
                _ => None,
            })
            .collect()
    }

    /// Uploaded attachments as `(target, file name, contents)`.
    pub fn uploads(&self) -> Vec<(AttachmentTarget, String, Vec<u8>)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TrackerCall::UploadAttachment {
                    target,
                    file_name,
                    bytes,
                    ..
                } => Some((*target, file_name.clone(), bytes.clone())),
                _ => None,
            })
            .collect()
    }

    /// Runs marked complete, with their aborted flag.
    pub fn completed_runs(&self) -> Vec<(RunId, bool)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TrackerCall::CompleteRun { run_id, aborted } => Some((*run_id, *aborted)),
                _ => None,
            })
            .collect()
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn enter(&self, op: Op) -> TrackerResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let stalled = self.lock().stalled.contains(&op);
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut recorder = self.lock();
        let fault = recorder
            .faults
            .iter_mut()
            .find(|f| f.remaining > 0 && f.op.is_none_or(|o| o == op));
        if let Some(fault) = fault {
            fault.remaining -= 1;
            let err = (fault.make)();
            recorder.failed.push(op);
            return Err(err);
        }
        Ok(())
    }

    fn record(&self, call: TrackerCall) {
        if self.log_calls {
            info!("[{}] {}", self.name, call.summary());
        }
        self.lock().calls.push(call);
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunTracker for MemoryTracker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_run(&self, metadata: &RunMetadata) -> TrackerResult<RunId> {
        self.enter(Op::CreateRun).await?;
        let run_id = RunId(self.next_id());
        self.record(TrackerCall::CreateRun {
            name: metadata.name.clone(),
        });
        Ok(run_id)
    }

    async fn create_parents(
        &self,
        run_id: RunId,
        keys: &[String],
        _started_at: DateTime<Utc>,
        source: Option<&str>,
    ) -> TrackerResult<HashMap<String, ParentId>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        self.enter(Op::CreateParents).await?;

        let parents = keys
            .iter()
            .map(|key| (key.clone(), ParentId(self.next_id())))
            .collect();
        self.record(TrackerCall::CreateParents {
            run_id,
            keys: keys.to_vec(),
            source: source.map(str::to_string),
        });
        Ok(parents)
    }

    async fn report_result(
        &self,
        run_id: RunId,
        parent_id: ParentId,
        report: &ResultReport,
    ) -> TrackerResult<()> {
        self.enter(Op::ReportResult).await?;
        self.record(TrackerCall::ReportResult {
            run_id,
            parent_id,
            report: report.clone(),
        });
        Ok(())
    }

    async fn report_rerun_result(
        &self,
        run_id: RunId,
        parent_id: ParentId,
        report: &RerunReport,
    ) -> TrackerResult<SubResultId> {
        self.enter(Op::ReportRerun).await?;
        let sub_result_id = SubResultId(self.next_id());
        self.record(TrackerCall::ReportRerun {
            run_id,
            parent_id,
            sub_result_id,
            report: report.clone(),
        });
        Ok(sub_result_id)
    }

    async fn upload_attachment(
        &self,
        run_id: RunId,
        target: AttachmentTarget,
        upload: &AttachmentUpload,
    ) -> TrackerResult<()> {
        self.enter(Op::UploadAttachment).await?;
        self.record(TrackerCall::UploadAttachment {
            run_id,
            target,
            file_name: upload.file_name.clone(),
            kind: upload.kind,
            bytes: upload.bytes.clone(),
        });
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: RunId,
        aborted: bool,
        _completed_at: DateTime<Utc>,
    ) -> TrackerResult<()> {
        self.enter(Op::CompleteRun).await?;
        self.record(TrackerCall::CompleteRun { run_id, aborted });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_parent_batch_is_a_no_op() {
        let tracker = MemoryTracker::new();
        let parents = tracker
            .create_parents(RunId(1), &[], Utc::now(), None)
            .await
            .unwrap();

        assert!(parents.is_empty());
        assert!(tracker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_targeted_fault_only_hits_its_operation() {
        let tracker = MemoryTracker::new();
        tracker.fail_next(Op::CreateParents, 1, || {
            TrackerError::Transient("busy".into())
        });

        let run_id = tracker.create_run(&RunMetadata::new("r")).await.unwrap();
        let keys = vec!["A".to_string()];
        assert!(tracker
            .create_parents(run_id, &keys, Utc::now(), None)
            .await
            .is_err());
        assert!(tracker
            .create_parents(run_id, &keys, Utc::now(), None)
            .await
            .is_ok());

        assert_eq!(tracker.failed_calls(), vec![Op::CreateParents]);
        assert_eq!(tracker.parent_batches(), vec![keys]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_operation_never_returns() {
        let tracker = MemoryTracker::new();
        tracker.stall(Op::CompleteRun);

        let call = tracker.complete_run(RunId(1), false, Utc::now());
        let outcome = tokio::time::timeout(Duration::from_secs(3600), call).await;
        assert!(outcome.is_err());

        tracker.resume(Op::CompleteRun);
        tracker.complete_run(RunId(1), true, Utc::now()).await.unwrap();
        assert_eq!(tracker.completed_runs(), vec![(RunId(1), true)]);
    }
}
