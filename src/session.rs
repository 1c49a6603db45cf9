//! Reporting sessions: enqueue results while tests run, flush at the end.
//!
//! A [`ReportingSession`] owns one queue, one consumer task and one run
//! handle. Producers enqueue through cheap [`ResultSink`] clones; the host
//! calls [`ReportingSession::flush`] once when the run is over.
//!
//! # Flush protocol
//!
//! 1. **Drain.** The queue is cancelled and the consumer is given
//!    `drain` time to forward what is left. If it is still busy, the abort
//!    token fires (cancelling the in-flight tracker call) and the consumer
//!    gets a further `abort` window. A consumer that is still running after
//!    that is torn down and the flush fails with
//!    [`FlushError::DrainTimeout`].
//! 2. **Finalize.** Run-level attachments are uploaded and the run is
//!    completed, within `finalize` time. Runs the session did not create are
//!    left open unless configured otherwise. Finalize failures are logged and
//!    reflected in [`FlushReport::run_completed`]; they do not fail the flush.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use runfeed::result::{ObservedResult, RunComplete, TestOutcome};
//! use runfeed::run::{RunHandle, RunId, RunMetadata, RunOwnership};
//! use runfeed::session::{ReportingSession, SessionOptions};
//! use runfeed::tracker::memory::MemoryTracker;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let run = RunHandle::new(RunId(1), RunMetadata::new("unit"), RunOwnership::Created);
//! let session = ReportingSession::start(
//!     Arc::new(MemoryTracker::new()),
//!     run,
//!     SessionOptions::default(),
//! );
//!
//! session.enqueue(ObservedResult::new("Ns.Tests.Adds", TestOutcome::Passed));
//!
//! let report = session.flush(RunComplete::completed()).await.unwrap();
//! assert_eq!(report.stats.forwarded, 1);
//! assert!(report.run_completed);
//! # }
//! ```

pub mod consumer;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::grouping::{RerunPolicy, ResultGrouper};
use crate::queue::HandoffQueue;
use crate::result::{ObservedResult, RunComplete};
use crate::run::{RunHandle, RunOwnership};
use crate::tracker::{AttachmentTarget, RunTracker, TrackerError};
use consumer::{Consumer, ConsumerOutcome};

/// Counters returned by the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Results reported, first reports and reruns.
    pub forwarded: usize,
    /// Of those, results reported as rerun sub-results.
    pub reruns: usize,
    pub parents_created: usize,
    /// Times a result was carried into a later batch.
    pub deferred: usize,
    /// Results given up on because their parent was never created.
    pub dropped: usize,
    /// Reports the tracker refused; not retried.
    pub failed_deliveries: usize,
    pub attachments_uploaded: usize,
}

/// Time budget for [`ReportingSession::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTimeouts {
    pub drain: Duration,
    pub finalize: Duration,
    pub abort: Duration,
}

impl Default for FlushTimeouts {
    fn default() -> Self {
        Self {
            drain: Duration::from_secs(60),
            finalize: Duration::from_secs(60),
            abort: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub grouper: ResultGrouper,
    pub rerun_policy: RerunPolicy,
    /// How many later batches a result may wait for its parent.
    pub max_deferrals: u32,
    pub timeouts: FlushTimeouts,
    /// Complete runs this session attached to, not only the ones it created.
    pub complete_attached_run: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            grouper: ResultGrouper::new(true),
            rerun_policy: RerunPolicy::default(),
            max_deferrals: 3,
            timeouts: FlushTimeouts::default(),
            complete_attached_run: false,
        }
    }
}

/// Outcome of a successful flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub run: RunHandle,
    pub stats: SessionStats,
    /// The run was marked completed or aborted on the tracker.
    pub run_completed: bool,
    pub elapsed: Duration,
}

/// Errors from [`ReportingSession::flush`].
///
/// Each variant means some enqueued results may not have reached the
/// tracker.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("Consumer did not stop within {waited:?}; queued results may not have been reported")]
    DrainTimeout { waited: Duration },

    #[error("{undelivered} result(s) were not reported before the consumer stopped")]
    Incomplete {
        undelivered: usize,
        stats: SessionStats,
    },

    #[error("Consumer failed: {reason} ({undelivered} result(s) not reported)")]
    ConsumerFailed {
        reason: String,
        undelivered: usize,
        stats: SessionStats,
    },
}

impl FlushError {
    /// Counters gathered before the failure, when the consumer returned any.
    pub fn stats(&self) -> Option<&SessionStats> {
        match self {
            FlushError::DrainTimeout { .. } => None,
            FlushError::Incomplete { stats, .. } | FlushError::ConsumerFailed { stats, .. } => {
                Some(stats)
            }
        }
    }
}

impl ConsumerOutcome {
    fn into_result(self) -> Result<SessionStats, FlushError> {
        if let Some(reason) = self.failure {
            return Err(FlushError::ConsumerFailed {
                reason,
                undelivered: self.undelivered,
                stats: self.stats,
            });
        }
        if self.aborted || self.undelivered > 0 {
            return Err(FlushError::Incomplete {
                undelivered: self.undelivered,
                stats: self.stats,
            });
        }
        Ok(self.stats)
    }
}

/// Producer handle; clone freely and move into test-runner callbacks.
#[derive(Clone)]
pub struct ResultSink {
    queue: Arc<HandoffQueue<ObservedResult>>,
}

impl ResultSink {
    /// Hands a result to the consumer. Never blocks.
    pub fn enqueue(&self, result: ObservedResult) {
        if let Err(result) = self.queue.try_enqueue(result) {
            warn!("Result {} arrived after flush started; not reported", result.name);
        }
    }
}

/// One reporting session against one run.
pub struct ReportingSession {
    queue: Arc<HandoffQueue<ObservedResult>>,
    abort: CancellationToken,
    consumer: JoinHandle<ConsumerOutcome>,
    tracker: Arc<dyn RunTracker>,
    run: RunHandle,
    timeouts: FlushTimeouts,
    complete_attached_run: bool,
    started: Instant,
}

impl ReportingSession {
    /// Spawns the consumer task. Must be called inside a Tokio runtime.
    pub fn start(tracker: Arc<dyn RunTracker>, run: RunHandle, options: SessionOptions) -> Self {
        let queue = Arc::new(HandoffQueue::new());
        let abort = CancellationToken::new();

        let span = info_span!(
            "session",
            run_id = %run.id,
            session = %uuid::Uuid::new_v4()
        );
        let consumer = Consumer::new(
            Arc::clone(&tracker),
            run.id,
            Arc::clone(&queue),
            abort.clone(),
            options.grouper,
            options.rerun_policy,
            options.max_deferrals,
        );
        let consumer = tokio::spawn(consumer.run().instrument(span));

        debug!("Started reporting session for run {}", run.id);
        Self {
            queue,
            abort,
            consumer,
            tracker,
            run,
            timeouts: options.timeouts,
            complete_attached_run: options.complete_attached_run,
            started: Instant::now(),
        }
    }

    pub fn run(&self) -> &RunHandle {
        &self.run
    }

    pub fn sink(&self) -> ResultSink {
        ResultSink {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn enqueue(&self, result: ObservedResult) {
        self.queue.enqueue(result);
    }

    /// Results waiting for the consumer.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Drains the queue and finalizes the run. See the module docs.
    pub async fn flush(self, signal: RunComplete) -> Result<FlushReport, FlushError> {
        let ReportingSession {
            queue,
            abort,
            mut consumer,
            tracker,
            mut run,
            timeouts,
            complete_attached_run,
            started,
        } = self;

        info!("Flushing run {} ({} result(s) queued)", run.id, queue.len());
        queue.cancel();

        let drained = match timeout(timeouts.drain, &mut consumer).await {
            Ok(joined) => Ok(joined),
            Err(_) => {
                warn!(
                    "Consumer still busy after {:?}, aborting in-flight tracker calls",
                    timeouts.drain
                );
                abort.cancel();
                match timeout(timeouts.abort, &mut consumer).await {
                    Ok(joined) => Ok(joined),
                    Err(_) => {
                        consumer.abort();
                        let waited = timeouts.drain + timeouts.abort;
                        error!("Consumer did not stop within {:?}", waited);
                        Err(FlushError::DrainTimeout { waited })
                    }
                }
            }
        };

        let drained = match drained {
            Ok(Ok(outcome)) => outcome.into_result(),
            Ok(Err(e)) => Err(FlushError::ConsumerFailed {
                reason: e.to_string(),
                undelivered: queue.len(),
                stats: SessionStats::default(),
            }),
            Err(e) => Err(e),
        };
        if let Err(e) = &drained {
            error!("{}", e);
        }

        let finalized = finalize(
            tracker.as_ref(),
            &run,
            &signal,
            complete_attached_run,
            timeouts.finalize,
        )
        .await;
        let run_completed = finalized.completed;
        if run_completed {
            run.mark_finished(signal.aborted);
        }

        let mut stats = drained?;
        stats.attachments_uploaded += finalized.uploaded;

        let elapsed = started.elapsed();
        info!(
            "Flushed run {} in {:.1}s: {} result(s) reported",
            run.id,
            elapsed.as_secs_f64(),
            stats.forwarded
        );
        Ok(FlushReport {
            run,
            stats,
            run_completed,
            elapsed,
        })
    }
}

struct Finalized {
    uploaded: usize,
    completed: bool,
}

/// Phase 2: run-level attachments, then run completion.
async fn finalize(
    tracker: &dyn RunTracker,
    run: &RunHandle,
    signal: &RunComplete,
    complete_attached_run: bool,
    limit: Duration,
) -> Finalized {
    let mut uploaded = 0;
    let work = async {
        for upload in consumer::diagnostics(&signal.attachments, None).await {
            match tracker
                .upload_attachment(run.id, AttachmentTarget::run(), &upload)
                .await
            {
                Ok(()) => uploaded += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Failed to upload run attachment {}: {}", upload.file_name, e),
            }
        }

        if run.ownership == RunOwnership::Attached && !complete_attached_run {
            debug!("Leaving run {} open for the step that created it", run.id);
            return Ok(false);
        }

        tracker
            .complete_run(run.id, signal.aborted, Utc::now())
            .await?;
        Ok::<bool, TrackerError>(true)
    };

    let completed = match timeout(limit, work).await {
        Ok(Ok(completed)) => {
            if completed {
                let state = if signal.aborted { "aborted" } else { "completed" };
                info!("Run {} marked {}", run.id, state);
            }
            completed
        }
        Ok(Err(e)) => {
            error!("Failed to finalize run {}: {}", run.id, e);
            false
        }
        Err(_) => {
            error!("Run {} was not finalized within {:?}", run.id, limit);
            false
        }
    };

    Finalized {
        uploaded,
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{Attachment, ConsoleStream, TestOutcome};
    use crate::run::{RunId, RunMetadata, RunState};
    use crate::tracker::memory::{MemoryTracker, Op};

    fn handle(ownership: RunOwnership) -> RunHandle {
        RunHandle::new(RunId(7), RunMetadata::new("unit"), ownership)
    }

    #[tokio::test]
    async fn test_flush_completes_created_run() {
        let tracker = Arc::new(MemoryTracker::new());
        let session = ReportingSession::start(
            tracker.clone(),
            handle(RunOwnership::Created),
            SessionOptions::default(),
        );
        session.enqueue(ObservedResult::new("A.B.C", TestOutcome::Passed));

        let signal = RunComplete::aborted().with_attachment(Attachment::Console {
            stream: ConsoleStream::Stdout,
            text: "host log".into(),
        });
        let report = session.flush(signal).await.unwrap();

        assert!(report.run_completed);
        assert_eq!(report.run.state(), RunState::Aborted);
        assert_eq!(report.stats.attachments_uploaded, 1);
        assert_eq!(tracker.completed_runs(), vec![(RunId(7), true)]);

        let uploads = tracker.uploads();
        assert_eq!(uploads[0].0, AttachmentTarget::run());
        assert_eq!(uploads[0].1, consumer::CONSOLE_OUTPUT_FILE);
    }

    #[tokio::test]
    async fn test_attached_run_left_open_by_default() {
        let tracker = Arc::new(MemoryTracker::new());
        let session = ReportingSession::start(
            tracker.clone(),
            handle(RunOwnership::Attached),
            SessionOptions::default(),
        );

        let report = session.flush(RunComplete::completed()).await.unwrap();
        assert!(!report.run_completed);
        assert_eq!(report.run.state(), RunState::InProgress);
        assert!(tracker.completed_runs().is_empty());
    }

    #[tokio::test]
    async fn test_attached_run_completed_when_configured() {
        let tracker = Arc::new(MemoryTracker::new());
        let options = SessionOptions {
            complete_attached_run: true,
            ..Default::default()
        };
        let session =
            ReportingSession::start(tracker.clone(), handle(RunOwnership::Attached), options);

        let report = session.flush(RunComplete::completed()).await.unwrap();
        assert!(report.run_completed);
        assert_eq!(report.run.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn test_finalize_failure_does_not_fail_flush() {
        let tracker = Arc::new(MemoryTracker::new());
        tracker.fail_next(Op::CompleteRun, 1, || {
            TrackerError::Transient("503".into())
        });
        let session = ReportingSession::start(
            tracker.clone(),
            handle(RunOwnership::Created),
            SessionOptions::default(),
        );

        let report = session.flush(RunComplete::completed()).await.unwrap();
        assert!(!report.run_completed);
        assert_eq!(report.run.state(), RunState::InProgress);
    }

    #[tokio::test]
    async fn test_consumer_failure_is_reported_without_waiting() {
        let tracker = Arc::new(MemoryTracker::new());
        tracker.fail_next(Op::CreateParents, 1, || {
            TrackerError::Unauthorized("401".into())
        });
        let session = ReportingSession::start(
            tracker.clone(),
            handle(RunOwnership::Created),
            SessionOptions::default(),
        );
        session.enqueue(ObservedResult::new("A.B.C", TestOutcome::Passed));

        let err = session.flush(RunComplete::completed()).await.unwrap_err();
        match err {
            FlushError::ConsumerFailed { undelivered, .. } => assert_eq!(undelivered, 1),
            other => panic!("unexpected error: {other}"),
        }
        // The run is still finalized.
        assert_eq!(tracker.completed_runs(), vec![(RunId(7), false)]);
    }

    #[tokio::test]
    async fn test_sink_rejects_results_after_flush_started() {
        let tracker = Arc::new(MemoryTracker::new());
        let session = ReportingSession::start(
            tracker.clone(),
            handle(RunOwnership::Created),
            SessionOptions::default(),
        );
        let sink = session.sink();
        sink.enqueue(ObservedResult::new("A.B.C", TestOutcome::Passed));

        let report = session.flush(RunComplete::completed()).await.unwrap();
        sink.enqueue(ObservedResult::new("A.B.D", TestOutcome::Passed));

        assert_eq!(report.stats.forwarded, 1);
        assert_eq!(tracker.results().len(), 1);
    }
}
