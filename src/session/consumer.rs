//! The consumer loop.
//!
//! One consumer runs per session, as a spawned task. It moves through three
//! states:
//!
//! - **Waiting**: suspended in [`HandoffQueue::take_batch`].
//! - **Draining**: forwarding one batch: parents first, then each result
//!   under its parent, then diagnostics.
//! - **Stopped**: the queue was cancelled and is empty, a fatal tracker
//!   error occurred, or the flush coordinator fired the abort token.
//!
//! Batch-local failures (a parent creation or a report that fails
//! transiently) are logged and counted; the loop keeps going. Results whose
//! parent could not be created are carried into the next batch a bounded
//! number of times and then dropped, never silently.

use std::future::Future;
use std::sync::Arc;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SessionStats;
use crate::grouping::{RerunPolicy, ResultGrouper};
use crate::queue::HandoffQueue;
use crate::registry::{FirstAttempt, ParentRegistry};
use crate::result::{Attachment, ConsoleStream, ErrorInfo, ObservedResult, console_text};
use crate::tracker::{
    AttachmentTarget, AttachmentUpload, RerunReport, ResultReport, RunId, RunTracker,
    TrackerError, TrackerResult,
};

pub const CONSOLE_OUTPUT_FILE: &str = "console output.txt";
pub const CONSOLE_ERROR_FILE: &str = "console error.txt";
pub const ERROR_FILE: &str = "error.txt";

/// Consumer loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Waiting,
    Draining,
    Stopped,
}

/// What the consumer hands back to the flush coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOutcome {
    pub stats: SessionStats,
    /// Set when a fatal tracker error stopped the loop.
    pub failure: Option<String>,
    /// Results that were enqueued but never reported.
    pub undelivered: usize,
    /// The loop stopped because the abort token fired.
    pub aborted: bool,
}

/// Why forwarding stopped early.
enum Halt {
    Aborted,
    Fatal(TrackerError),
}

struct Pending {
    result: ObservedResult,
    deferrals: u32,
}

pub(crate) struct Consumer {
    tracker: Arc<dyn RunTracker>,
    run_id: RunId,
    queue: Arc<HandoffQueue<ObservedResult>>,
    abort: CancellationToken,
    grouper: ResultGrouper,
    rerun_policy: RerunPolicy,
    max_deferrals: u32,
    registry: ParentRegistry,
    deferred: Vec<Pending>,
    state: ConsumerState,
    stats: SessionStats,
}

/// Races a tracker call against the abort token.
async fn guarded<T>(
    abort: &CancellationToken,
    call: impl Future<Output = TrackerResult<T>>,
) -> TrackerResult<T> {
    select! {
        biased;
        _ = abort.cancelled() => Err(TrackerError::Aborted),
        result = call => result,
    }
}

impl Consumer {
    pub(crate) fn new(
        tracker: Arc<dyn RunTracker>,
        run_id: RunId,
        queue: Arc<HandoffQueue<ObservedResult>>,
        abort: CancellationToken,
        grouper: ResultGrouper,
        rerun_policy: RerunPolicy,
        max_deferrals: u32,
    ) -> Self {
        Self {
            tracker,
            run_id,
            queue,
            abort,
            grouper,
            rerun_policy,
            max_deferrals,
            registry: ParentRegistry::new(),
            deferred: Vec::new(),
            state: ConsumerState::Waiting,
            stats: SessionStats::default(),
        }
    }

    pub(crate) async fn run(mut self) -> ConsumerOutcome {
        loop {
            debug_assert_eq!(self.state, ConsumerState::Waiting);

            let batch = select! {
                biased;
                _ = self.abort.cancelled() => None,
                batch = self.queue.take_batch() => Some(batch),
            };
            let Some(batch) = batch else {
                return self.stop(None, true);
            };

            // Empty only once the queue is cancelled and drained.
            if batch.is_empty() && self.deferred.is_empty() {
                info!(
                    "Queue drained: {} result(s) forwarded",
                    self.stats.forwarded
                );
                return self.stop(None, false);
            }

            self.state = ConsumerState::Draining;
            debug!(
                "Forwarding batch of {} (+{} deferred)",
                batch.len(),
                self.deferred.len()
            );
            match self.forward(batch).await {
                Ok(()) => self.state = ConsumerState::Waiting,
                Err(Halt::Aborted) => {
                    warn!("Consumer aborted with a tracker call in flight");
                    return self.stop(None, true);
                }
                Err(Halt::Fatal(e)) => {
                    error!("Stopping consumer after fatal tracker error: {}", e);
                    return self.stop(Some(e.to_string()), false);
                }
            }
        }
    }

    fn stop(mut self, failure: Option<String>, aborted: bool) -> ConsumerOutcome {
        self.state = ConsumerState::Stopped;
        ConsumerOutcome {
            stats: self.stats,
            failure,
            undelivered: self.deferred.len() + self.queue.len(),
            aborted,
        }
    }

    async fn forward(&mut self, batch: Vec<ObservedResult>) -> Result<(), Halt> {
        let mut items = std::mem::take(&mut self.deferred);
        items.extend(batch.into_iter().map(|result| Pending {
            result,
            deferrals: 0,
        }));

        let keys: Vec<String> = items
            .iter()
            .map(|item| self.grouper.parent_key(&item.result.name))
            .collect();

        let ensured = guarded(
            &self.abort,
            self.registry.ensure_parents(
                self.tracker.as_ref(),
                self.run_id,
                &keys,
                self.grouper.source(),
            ),
        )
        .await;
        match ensured {
            Ok(created) => self.stats.parents_created += created,
            Err(e) => {
                if let Some(halt) = halt_for(e, "create parent records") {
                    self.deferred = items;
                    return Err(halt);
                }
            }
        }

        let mut pending = items.into_iter().zip(keys);
        while let Some((item, key)) = pending.next() {
            if !self.registry.contains(&key) {
                self.defer(item);
                continue;
            }

            let forwarded = self.stats.forwarded;
            if let Err(halt) = self.deliver(&item.result, &key).await {
                if self.stats.forwarded == forwarded {
                    self.deferred.push(item);
                }
                self.deferred.extend(pending.map(|(item, _)| item));
                return Err(halt);
            }
        }
        Ok(())
    }

    fn defer(&mut self, mut item: Pending) {
        item.deferrals += 1;
        if item.deferrals > self.max_deferrals {
            error!(
                "Dropping result {}: no parent record after {} attempt(s)",
                item.result.name, item.deferrals
            );
            self.stats.dropped += 1;
        } else {
            debug!(
                "Deferring {} until its parent exists ({}/{})",
                item.result.name, item.deferrals, self.max_deferrals
            );
            self.stats.deferred += 1;
            self.deferred.push(item);
        }
    }

    /// Reports one result whose parent exists.
    async fn deliver(&mut self, result: &ObservedResult, key: &str) -> Result<(), Halt> {
        let Some(record) = self.registry.get(key) else {
            return Ok(());
        };
        let parent_id = record.remote_id;
        let revision = record.revision();
        let attempt = record.attempts_of(&result.name) + 1;

        if revision == 0 {
            let report = ResultReport::from_result(result);
            let reported = guarded(
                &self.abort,
                self.tracker.report_result(self.run_id, parent_id, &report),
            )
            .await;
            if let Err(e) = reported {
                return self.delivery_failed(result, e);
            }

            self.stats.forwarded += 1;
            let first = (self.rerun_policy == RerunPolicy::PreserveFirstFailure).then(|| {
                FirstAttempt {
                    report,
                    display_name: result.display_name().to_string(),
                }
            });
            if let Some(record) = self.registry.get_mut(key) {
                record.commit(&result.name, first);
            }

            if result.needs_diagnostics() {
                self.upload(result, AttachmentTarget::parent(parent_id))
                    .await?;
            }
            return Ok(());
        }

        let rerun = attempt > 1;
        if rerun && self.rerun_policy == RerunPolicy::PreserveFirstFailure {
            self.copy_first_failure(key, &result.name).await?;
        }

        let report = RerunReport::from_result(result, revision, attempt);
        let reported = guarded(
            &self.abort,
            self.tracker
                .report_rerun_result(self.run_id, parent_id, &report),
        )
        .await;
        let sub_result_id = match reported {
            Ok(id) => id,
            Err(e) => return self.delivery_failed(result, e),
        };

        self.stats.forwarded += 1;
        if rerun {
            self.stats.reruns += 1;
        }
        if let Some(record) = self.registry.get_mut(key) {
            record.commit(&result.name, None);
        }
        debug!("Reported {} as revision {}", report.display_name, revision);

        if rerun || result.needs_diagnostics() {
            self.upload(result, AttachmentTarget::sub_result(parent_id, sub_result_id))
                .await?;
        }
        Ok(())
    }

    /// Copies a failed first attempt of `name` as the `#1` sub-result, once
    /// per parent.
    async fn copy_first_failure(&mut self, key: &str, name: &str) -> Result<(), Halt> {
        let Some(record) = self.registry.get(key) else {
            return Ok(());
        };
        let Some(first) = record.uncopied_first_failure(name) else {
            return Ok(());
        };
        let parent_id = record.remote_id;
        let copy = RerunReport::first_attempt_copy(&first.report, &first.display_name);

        let copied = guarded(
            &self.abort,
            self.tracker.report_rerun_result(self.run_id, parent_id, &copy),
        )
        .await;
        match copied {
            Ok(_) => {
                if let Some(record) = self.registry.get_mut(key) {
                    record.mark_first_attempt_copied();
                }
                Ok(())
            }
            Err(e) => match halt_for(e, "copy first failure") {
                Some(halt) => Err(halt),
                None => Ok(()),
            },
        }
    }

    fn delivery_failed(&mut self, result: &ObservedResult, e: TrackerError) -> Result<(), Halt> {
        let what = format!("report {}", result.name);
        match halt_for(e, &what) {
            Some(halt) => Err(halt),
            None => {
                self.stats.failed_deliveries += 1;
                Ok(())
            }
        }
    }

    async fn upload(
        &mut self,
        result: &ObservedResult,
        target: AttachmentTarget,
    ) -> Result<(), Halt> {
        let uploads = diagnostics(&result.attachments, result.error.as_ref()).await;
        for upload in &uploads {
            let uploaded = guarded(
                &self.abort,
                self.tracker.upload_attachment(self.run_id, target, upload),
            )
            .await;
            match uploaded {
                Ok(()) => self.stats.attachments_uploaded += 1,
                Err(e) => {
                    let what = format!("upload {} for {}", upload.file_name, result.name);
                    if let Some(halt) = halt_for(e, &what) {
                        return Err(halt);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Logs a batch-local error, or turns it into a reason to stop.
fn halt_for(e: TrackerError, what: &str) -> Option<Halt> {
    match e {
        TrackerError::Aborted => Some(Halt::Aborted),
        e if e.is_fatal() => Some(Halt::Fatal(e)),
        e => {
            warn!("Failed to {}: {}", what, e);
            None
        }
    }
}

/// Builds the uploads for a set of attachments and optional error details.
///
/// Console messages become `console output.txt` and `console error.txt`,
/// error details `error.txt`. Files are read from disk; unreadable ones are
/// logged and skipped.
pub async fn diagnostics(
    attachments: &[Attachment],
    error: Option<&ErrorInfo>,
) -> Vec<AttachmentUpload> {
    let mut uploads = Vec::new();

    for (stream, file_name) in [
        (ConsoleStream::Stdout, CONSOLE_OUTPUT_FILE),
        (ConsoleStream::Stderr, CONSOLE_ERROR_FILE),
    ] {
        let text = console_text(attachments, stream);
        if !text.is_empty() {
            uploads.push(AttachmentUpload::text(file_name, &text));
        }
    }

    if let Some(error) = error.filter(|e| !e.is_empty()) {
        uploads.push(AttachmentUpload::text(ERROR_FILE, &error.render()));
    }

    for attachment in attachments {
        if let Attachment::File { path, description } = attachment {
            match AttachmentUpload::from_file(path, description.as_deref()).await {
                Ok(upload) => uploads.push(upload),
                Err(e) => warn!("Skipping attachment {}: {}", path.display(), e),
            }
        }
    }

    uploads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::TestOutcome;
    use crate::tracker::memory::{MemoryTracker, Op};

    fn consumer(
        tracker: Arc<MemoryTracker>,
        queue: Arc<HandoffQueue<ObservedResult>>,
        policy: RerunPolicy,
    ) -> Consumer {
        Consumer::new(
            tracker,
            RunId(1),
            queue,
            CancellationToken::new(),
            ResultGrouper::new(true).with_source("Foo"),
            policy,
            2,
        )
    }

    #[tokio::test]
    async fn test_stops_when_cancelled_and_drained() {
        let tracker = Arc::new(MemoryTracker::new());
        let queue = Arc::new(HandoffQueue::new());
        queue.enqueue(ObservedResult::new("Foo.A.T1", TestOutcome::Passed));
        queue.cancel();

        let outcome = consumer(tracker.clone(), queue, RerunPolicy::LatestOnly)
            .run()
            .await;

        assert_eq!(outcome.stats.forwarded, 1);
        assert_eq!(outcome.undelivered, 0);
        assert!(!outcome.aborted);
        assert_eq!(tracker.results().len(), 1);
    }

    #[tokio::test]
    async fn test_deferred_results_are_dropped_after_limit() {
        let tracker = Arc::new(MemoryTracker::new());
        tracker.fail_next(Op::CreateParents, 10, || {
            TrackerError::Transient("503".into())
        });
        let queue = Arc::new(HandoffQueue::new());
        queue.enqueue(ObservedResult::new("Foo.A.T1", TestOutcome::Passed));
        queue.cancel();

        let outcome = consumer(tracker.clone(), queue, RerunPolicy::LatestOnly)
            .run()
            .await;

        // One try plus two deferrals.
        assert_eq!(tracker.failed_calls().len(), 3);
        assert_eq!(outcome.stats.deferred, 2);
        assert_eq!(outcome.stats.dropped, 1);
        assert_eq!(outcome.undelivered, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_loop() {
        let tracker = Arc::new(MemoryTracker::new());
        tracker.fail_next(Op::ReportResult, 1, || {
            TrackerError::Unauthorized("401".into())
        });
        let queue = Arc::new(HandoffQueue::new());
        queue.enqueue(ObservedResult::new("Foo.A.T1", TestOutcome::Passed));
        queue.enqueue(ObservedResult::new("Foo.B.T1", TestOutcome::Passed));

        // Not cancelled: only the fatal error can end the loop.
        let outcome = consumer(tracker.clone(), queue, RerunPolicy::LatestOnly)
            .run()
            .await;

        assert!(outcome.failure.is_some());
        assert_eq!(outcome.undelivered, 2);
        assert!(tracker.results().is_empty());
    }

    #[tokio::test]
    async fn test_transient_report_failure_is_counted_and_skipped() {
        let tracker = Arc::new(MemoryTracker::new());
        tracker.fail_next(Op::ReportResult, 1, || {
            TrackerError::Rejected("400".into())
        });
        let queue = Arc::new(HandoffQueue::new());
        queue.enqueue(ObservedResult::new("Foo.A.T1", TestOutcome::Passed));
        queue.enqueue(ObservedResult::new("Foo.B.T1", TestOutcome::Passed));
        queue.cancel();

        let outcome = consumer(tracker.clone(), queue, RerunPolicy::LatestOnly)
            .run()
            .await;

        assert_eq!(outcome.stats.failed_deliveries, 1);
        assert_eq!(outcome.stats.forwarded, 1);
        assert!(outcome.failure.is_none());
    }

    #[tokio::test]
    async fn test_preserve_first_failure_copies_it_once() {
        let tracker = Arc::new(MemoryTracker::new());
        let queue = Arc::new(HandoffQueue::new());
        queue.enqueue(ObservedResult::new("Foo.A.T1", TestOutcome::Failed));
        queue.enqueue(ObservedResult::new("Foo.A.T1", TestOutcome::Failed));
        queue.enqueue(ObservedResult::new("Foo.A.T1", TestOutcome::Passed));
        queue.cancel();

        consumer(tracker.clone(), queue, RerunPolicy::PreserveFirstFailure)
            .run()
            .await;

        let names: Vec<_> = tracker
            .reruns()
            .into_iter()
            .map(|(_, r)| (r.display_name, r.revision))
            .collect();
        assert_eq!(
            names,
            vec![
                ("#1 T1".to_string(), 0),
                ("#2 T1".to_string(), 1),
                ("#3 T1".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_preserve_first_failure_ignores_sibling_methods() {
        let tracker = Arc::new(MemoryTracker::new());
        let queue = Arc::new(HandoffQueue::new());
        queue.enqueue(ObservedResult::new("Foo.A.T1", TestOutcome::Failed));
        queue.enqueue(ObservedResult::new("Foo.A.T2", TestOutcome::Passed));
        queue.enqueue(ObservedResult::new("Foo.A.T1", TestOutcome::Passed));
        queue.cancel();

        let outcome = consumer(tracker.clone(), queue, RerunPolicy::PreserveFirstFailure)
            .run()
            .await;

        let names: Vec<_> = tracker
            .reruns()
            .into_iter()
            .map(|(_, r)| (r.display_name, r.revision, r.flaky))
            .collect();
        assert_eq!(
            names,
            vec![
                ("T2".to_string(), 1, false),
                ("#1 T1".to_string(), 0, false),
                ("#2 T1".to_string(), 2, true),
            ]
        );
        assert_eq!(outcome.stats.reruns, 1);
    }

    #[tokio::test]
    async fn test_diagnostics_skip_unreadable_files() {
        let attachments = vec![
            Attachment::Console {
                stream: ConsoleStream::Stderr,
                text: "boom".into(),
            },
            Attachment::File {
                path: "/nonexistent/trace.log".into(),
                description: None,
            },
        ];
        let error = ErrorInfo {
            message: Some("expected 1".into()),
            stack_trace: None,
        };

        let uploads = diagnostics(&attachments, Some(&error)).await;
        let names: Vec<_> = uploads.iter().map(|u| u.file_name.as_str()).collect();
        assert_eq!(names, vec![CONSOLE_ERROR_FILE, ERROR_FILE]);
    }
}
