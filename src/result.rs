//! Observed test results and run completion signals.
//!
//! An [`ObservedResult`] is created by the host test runner when a test case
//! finishes and is moved into the reporting queue. It is never mutated after
//! that point; everything the consumer needs to report it (outcome, timing,
//! error details, console output, files) travels with it.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use runfeed::result::{ConsoleStream, ObservedResult, TestOutcome};
//!
//! let result = ObservedResult::new("Foo.BarTests.Test2", TestOutcome::Failed)
//!     .with_duration(Duration::from_millis(42))
//!     .with_error("expected 2, got 3", Some("at BarTests.Test2() line 12"))
//!     .with_console(ConsoleStream::Stdout, "starting");
//!
//! assert!(result.needs_diagnostics());
//! assert_eq!(result.console_text(ConsoleStream::Stdout), "starting\n");
//! ```

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    /// Test passed all assertions.
    Passed,

    /// Test failed an assertion or threw.
    Failed,

    /// Test was skipped by the host runner.
    Skipped,

    /// The host runner could not find the test.
    NotFound,

    /// The host runner reported no outcome.
    #[serde(alias = "none")]
    Unspecified,
}

impl TestOutcome {
    /// Returns `true` for outcomes that get diagnostics uploaded.
    pub fn is_failure(&self) -> bool {
        matches!(self, TestOutcome::Failed)
    }

    /// Outcome label understood by the tracking service.
    ///
    /// ```
    /// use runfeed::result::TestOutcome;
    ///
    /// assert_eq!(TestOutcome::Skipped.tracker_label(), "Inconclusive");
    /// assert_eq!(TestOutcome::NotFound.tracker_label(), "NotExecuted");
    /// ```
    pub fn tracker_label(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "Passed",
            TestOutcome::Failed => "Failed",
            TestOutcome::Skipped => "Inconclusive",
            TestOutcome::NotFound => "NotExecuted",
            TestOutcome::Unspecified => "None",
        }
    }
}

/// Which console stream a captured message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// A diagnostic artifact attached to a result or to the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    /// A file on local disk, read when the attachment is uploaded.
    File {
        path: PathBuf,
        #[serde(default)]
        description: Option<String>,
    },

    /// One message the test wrote to stdout or stderr.
    Console { stream: ConsoleStream, text: String },
}

/// Error details captured for a failed test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: Option<String>,
    pub stack_trace: Option<String>,
}

impl ErrorInfo {
    pub fn is_empty(&self) -> bool {
        self.message.as_deref().is_none_or(str::is_empty)
            && self.stack_trace.as_deref().is_none_or(str::is_empty)
    }

    /// Renders message and stack trace as the body of an `error.txt` upload.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(message) = self.message.as_deref().filter(|m| !m.is_empty()) {
            out.push_str(message);
            out.push('\n');
        }
        if let Some(trace) = self.stack_trace.as_deref().filter(|t| !t.is_empty()) {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(trace);
            out.push('\n');
        }
        out
    }
}

/// Start, end and duration of one test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

/// One completed test case as delivered by the host test runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedResult {
    /// Fully-qualified name, e.g. `Namespace.Class.Method(args)`.
    pub name: String,

    pub outcome: TestOutcome,

    pub timing: Timing,

    pub error: Option<ErrorInfo>,

    /// Console messages and files, in the order the host produced them.
    pub attachments: Vec<Attachment>,
}

impl ObservedResult {
    /// Creates a result that started and finished now with zero duration.
    pub fn new(name: impl Into<String>, outcome: TestOutcome) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            outcome,
            timing: Timing {
                started_at: now,
                finished_at: now,
                duration: Duration::ZERO,
            },
            error: None,
            attachments: Vec::new(),
        }
    }

    /// Sets start and end time; duration is derived from them.
    pub fn with_times(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.timing = Timing {
            started_at,
            finished_at,
            duration: (finished_at - started_at).to_std().unwrap_or_default(),
        };
        self
    }

    /// Sets the duration, moving the end time to match.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.timing.duration = duration;
        let started_at = self.timing.started_at;
        self.timing.finished_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(started_at);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>, stack_trace: Option<&str>) -> Self {
        self.error = Some(ErrorInfo {
            message: Some(message.into()),
            stack_trace: stack_trace.map(str::to_string),
        });
        self
    }

    pub fn with_console(mut self, stream: ConsoleStream, text: impl Into<String>) -> Self {
        self.attachments.push(Attachment::Console {
            stream,
            text: text.into(),
        });
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(Attachment::File {
            path: path.into(),
            description: None,
        });
        self
    }

    /// Whether attachments are uploaded for this result on its first report.
    pub fn needs_diagnostics(&self) -> bool {
        self.outcome.is_failure()
    }

    /// All console messages for `stream`, one per line.
    pub fn console_text(&self, stream: ConsoleStream) -> String {
        console_text(&self.attachments, stream)
    }

    /// Short display name: the method segment with its arguments.
    ///
    /// ```
    /// use runfeed::result::{ObservedResult, TestOutcome};
    ///
    /// let r = ObservedResult::new("Ns.Class.Method(1.5)", TestOutcome::Passed);
    /// assert_eq!(r.display_name(), "Method(1.5)");
    /// ```
    pub fn display_name(&self) -> &str {
        let end = self.name.find('(').unwrap_or(self.name.len());
        match self.name[..end].rfind('.') {
            Some(dot) => &self.name[dot + 1..],
            None => &self.name,
        }
    }
}

/// Joins the console messages of one stream, one per line.
pub fn console_text(attachments: &[Attachment], stream: ConsoleStream) -> String {
    let mut out = String::new();
    for attachment in attachments {
        if let Attachment::Console { stream: s, text } = attachment {
            if *s == stream {
                out.push_str(text);
                out.push('\n');
            }
        }
    }
    out
}

/// Signal delivered once by the host when the whole run has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunComplete {
    /// The run was aborted or cancelled by the host.
    pub aborted: bool,

    /// Run-level attachments (not scoped to a single test).
    pub attachments: Vec<Attachment>,
}

impl RunComplete {
    pub fn completed() -> Self {
        Self::default()
    }

    pub fn aborted() -> Self {
        Self {
            aborted: true,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_text_keeps_streams_apart() {
        let result = ObservedResult::new("A.B.C", TestOutcome::Failed)
            .with_console(ConsoleStream::Stdout, "one")
            .with_console(ConsoleStream::Stderr, "boom")
            .with_console(ConsoleStream::Stdout, "two");

        assert_eq!(result.console_text(ConsoleStream::Stdout), "one\ntwo\n");
        assert_eq!(result.console_text(ConsoleStream::Stderr), "boom\n");
    }

    #[test]
    fn test_with_times_derives_duration() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(1500);
        let result = ObservedResult::new("A.B.C", TestOutcome::Passed).with_times(start, end);

        assert_eq!(result.timing.duration, Duration::from_millis(1500));
    }

    #[test]
    fn test_with_times_clamps_negative_duration() {
        let start = Utc::now();
        let end = start - chrono::Duration::seconds(1);
        let result = ObservedResult::new("A.B.C", TestOutcome::Passed).with_times(start, end);

        assert_eq!(result.timing.duration, Duration::ZERO);
    }

    #[test]
    fn test_with_duration_out_of_range_keeps_start() {
        let result = ObservedResult::new("A.B.C", TestOutcome::Passed)
            .with_duration(Duration::from_millis(9_000_000_000_000_000));

        assert_eq!(result.timing.finished_at, result.timing.started_at);
        assert_eq!(
            result.timing.duration,
            Duration::from_millis(9_000_000_000_000_000)
        );
    }

    #[test]
    fn test_error_render() {
        let info = ErrorInfo {
            message: Some("assert failed".into()),
            stack_trace: Some("at X".into()),
        };
        assert_eq!(info.render(), "assert failed\n\nat X\n");
        assert!(ErrorInfo::default().is_empty());
    }

    #[test]
    fn test_display_name_without_namespace() {
        let r = ObservedResult::new("Standalone", TestOutcome::Passed);
        assert_eq!(r.display_name(), "Standalone");
    }

    #[test]
    fn test_only_failures_need_diagnostics() {
        assert!(ObservedResult::new("a.b", TestOutcome::Failed).needs_diagnostics());
        assert!(!ObservedResult::new("a.b", TestOutcome::Passed).needs_diagnostics());
        assert!(!ObservedResult::new("a.b", TestOutcome::Skipped).needs_diagnostics());
    }
}
