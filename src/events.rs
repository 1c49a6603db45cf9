//! Host event stream: newline-delimited JSON from the test runner.
//!
//! The host writes one event per line:
//!
//! ```text
//! {"event":"result","name":"Foo.BarTests.Test1","outcome":"passed","duration_ms":12}
//! {"event":"result","name":"Foo.BarTests.Test2","outcome":"failed","error_message":"expected 2",
//!  "attachments":[{"kind":"console","stream":"stdout","text":"starting"}]}
//! {"event":"complete","aborted":false}
//! ```
//!
//! Malformed lines are logged and skipped; a broken event must not take the
//! test run down with it. A stream that ends without a `complete` event is
//! treated as an aborted run.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use crate::result::{Attachment, ErrorInfo, ObservedResult, RunComplete, TestOutcome, Timing};
use crate::session::ResultSink;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    Result(ResultEvent),
    Complete(CompleteEvent),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultEvent {
    pub name: String,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompleteEvent {
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl ResultEvent {
    /// Converts to an [`ObservedResult`], filling in missing timing.
    ///
    /// With only a duration, the test is taken to have ended at
    /// `finished_at` (or now). With only timestamps, the duration is their
    /// difference.
    pub fn into_result(self) -> ObservedResult {
        let now = Utc::now();
        let duration = self.duration_ms.map(Duration::from_millis);

        let (started_at, finished_at) = match (self.started_at, self.finished_at, duration) {
            (Some(start), Some(end), _) => (start, end),
            // A duration past the representable range collapses to an instant.
            (Some(start), None, d) => {
                let end = start
                    .checked_add_signed(to_chrono(d.unwrap_or_default()))
                    .unwrap_or(start);
                (start, end)
            }
            (None, end, d) => {
                let end = end.unwrap_or(now);
                let start = end
                    .checked_sub_signed(to_chrono(d.unwrap_or_default()))
                    .unwrap_or(end);
                (start, end)
            }
        };
        let duration = duration
            .unwrap_or_else(|| (finished_at - started_at).to_std().unwrap_or_default());

        let error = if self.error_message.is_some() || self.stack_trace.is_some() {
            Some(ErrorInfo {
                message: self.error_message,
                stack_trace: self.stack_trace,
            })
        } else {
            None
        };

        ObservedResult {
            name: self.name,
            outcome: self.outcome,
            timing: Timing {
                started_at,
                finished_at,
                duration,
            },
            error,
            attachments: expand_paths(self.attachments),
        }
    }
}

impl CompleteEvent {
    pub fn into_signal(self) -> RunComplete {
        RunComplete {
            aborted: self.aborted,
            attachments: expand_paths(self.attachments),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

fn expand_paths(attachments: Vec<Attachment>) -> Vec<Attachment> {
    attachments
        .into_iter()
        .map(|attachment| match attachment {
            Attachment::File { path, description } => {
                let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
                Attachment::File {
                    path: PathBuf::from(expanded),
                    description,
                }
            }
            other => other,
        })
        .collect()
}

/// Parses one line. Blank lines yield `Ok(None)`.
pub fn parse_event(line: &str) -> serde_json::Result<Option<HostEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// What [`pump`] read from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub results: usize,
    pub skipped_lines: usize,
    /// Completion signal to flush with.
    pub completion: RunComplete,
    /// `false` if the stream ended without a `complete` event.
    pub saw_completion: bool,
}

/// Reads events until `complete` or end of stream, enqueueing each result.
pub async fn pump<R>(reader: R, sink: &ResultSink) -> std::io::Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut results = 0;
    let mut skipped_lines = 0;
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_event(&line) {
            Ok(None) => {}
            Ok(Some(HostEvent::Result(event))) => {
                debug!("Result event: {} {:?}", event.name, event.outcome);
                sink.enqueue(event.into_result());
                results += 1;
            }
            Ok(Some(HostEvent::Complete(event))) => {
                debug!("Run complete event at line {}", line_no);
                return Ok(IngestSummary {
                    results,
                    skipped_lines,
                    completion: event.into_signal(),
                    saw_completion: true,
                });
            }
            Err(e) => {
                warn!("Skipping malformed event on line {}: {}", line_no, e);
                skipped_lines += 1;
            }
        }
    }

    warn!("Event stream ended without a completion event; treating the run as aborted");
    Ok(IngestSummary {
        results,
        skipped_lines,
        completion: RunComplete::aborted(),
        saw_completion: false,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::result::ConsoleStream;
    use crate::run::{RunHandle, RunId, RunMetadata, RunOwnership};
    use crate::session::{ReportingSession, SessionOptions};
    use crate::tracker::memory::MemoryTracker;

    #[test]
    fn test_parse_result_event_with_attachments() {
        let line = r#"{"event":"result","name":"Foo.Bar.T2","outcome":"failed",
            "duration_ms":1500,"error_message":"expected 2",
            "attachments":[{"kind":"console","stream":"stderr","text":"boom"},
                           {"kind":"file","path":"/tmp/trace.log"}]}"#;

        let Some(HostEvent::Result(event)) = parse_event(line).unwrap() else {
            panic!("expected a result event");
        };
        let result = event.into_result();

        assert_eq!(result.outcome, TestOutcome::Failed);
        assert_eq!(result.timing.duration, Duration::from_millis(1500));
        assert_eq!(
            result.timing.finished_at - result.timing.started_at,
            chrono::Duration::milliseconds(1500)
        );
        assert_eq!(result.console_text(ConsoleStream::Stderr), "boom\n");
        assert_eq!(
            result.error.unwrap().message.as_deref(),
            Some("expected 2")
        );
    }

    #[test]
    fn test_timestamps_give_duration() {
        let line = r#"{"event":"result","name":"a.b","outcome":"passed","started_at":"2024-05-01T10:00:00Z","finished_at":"2024-05-01T10:00:02Z"}"#;
        let Some(HostEvent::Result(event)) = parse_event(line).unwrap() else {
            panic!("expected a result event");
        };
        assert_eq!(event.into_result().timing.duration, Duration::from_secs(2));
    }

    #[test]
    fn test_out_of_range_duration_does_not_panic() {
        let line = r#"{"event":"result","name":"a.b","outcome":"passed","duration_ms":9000000000000000}"#;
        let Some(HostEvent::Result(event)) = parse_event(line).unwrap() else {
            panic!("expected a result event");
        };
        let result = event.into_result();
        assert_eq!(result.timing.started_at, result.timing.finished_at);

        let line = r#"{"event":"result","name":"a.b","outcome":"passed","started_at":"2024-05-01T10:00:00Z","duration_ms":9000000000000000}"#;
        let Some(HostEvent::Result(event)) = parse_event(line).unwrap() else {
            panic!("expected a result event");
        };
        let result = event.into_result();
        assert_eq!(result.timing.started_at, result.timing.finished_at);
    }

    #[tokio::test]
    async fn test_pump_survives_huge_duration() {
        let input = concat!(
            r#"{"event":"result","name":"A.B.C","outcome":"passed","duration_ms":9000000000000000}"#,
            "\n",
            r#"{"event":"complete","aborted":false}"#,
            "\n",
        );

        let tracker = Arc::new(MemoryTracker::new());
        let run = RunHandle::new(RunId(1), RunMetadata::new("r"), RunOwnership::Created);
        let session = ReportingSession::start(tracker.clone(), run, SessionOptions::default());

        let summary = pump(input.as_bytes(), &session.sink()).await.unwrap();
        assert_eq!(summary.results, 1);
        let report = session.flush(summary.completion).await.unwrap();
        assert_eq!(report.stats.forwarded, 1);
    }

    #[test]
    fn test_none_outcome_alias() {
        let line = r#"{"event":"result","name":"a.b","outcome":"none"}"#;
        let Some(HostEvent::Result(event)) = parse_event(line).unwrap() else {
            panic!("expected a result event");
        };
        assert_eq!(event.outcome, TestOutcome::Unspecified);
    }

    #[test]
    fn test_blank_and_unknown_lines() {
        assert_eq!(parse_event("   ").unwrap(), None);
        assert!(parse_event(r#"{"event":"started"}"#).is_err());
        assert!(parse_event("not json").is_err());
    }

    #[tokio::test]
    async fn test_pump_skips_garbage_and_stops_at_complete() {
        let input = concat!(
            r#"{"event":"result","name":"A.B.C","outcome":"passed"}"#,
            "\n",
            "garbage\n",
            r#"{"event":"complete","aborted":false}"#,
            "\n",
            r#"{"event":"result","name":"A.B.D","outcome":"passed"}"#,
            "\n",
        );

        let tracker = Arc::new(MemoryTracker::new());
        let run = RunHandle::new(RunId(1), RunMetadata::new("r"), RunOwnership::Created);
        let session = ReportingSession::start(tracker.clone(), run, SessionOptions::default());

        let summary = pump(input.as_bytes(), &session.sink()).await.unwrap();
        assert_eq!(summary.results, 1);
        assert_eq!(summary.skipped_lines, 1);
        assert!(summary.saw_completion);
        assert!(!summary.completion.aborted);

        let report = session.flush(summary.completion).await.unwrap();
        assert_eq!(report.stats.forwarded, 1);
    }

    #[tokio::test]
    async fn test_pump_without_complete_is_aborted() {
        let input = r#"{"event":"result","name":"A.B.C","outcome":"passed"}"#;

        let tracker = Arc::new(MemoryTracker::new());
        let run = RunHandle::new(RunId(1), RunMetadata::new("r"), RunOwnership::Created);
        let session = ReportingSession::start(tracker.clone(), run, SessionOptions::default());

        let summary = pump(input.as_bytes(), &session.sink()).await.unwrap();
        assert!(!summary.saw_completion);
        assert!(summary.completion.aborted);
        session.flush(summary.completion).await.unwrap();
    }
}
