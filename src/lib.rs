//! runfeed: live test result reporting.
//!
//! This crate reports test outcomes to a remote test-run tracking service
//! while the tests are still running, without slowing the test run down,
//! and guarantees within a bounded time that everything observed was
//! delivered before the process exits.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Queue**: unbounded handoff between result producers and the consumer
//! - **Grouping**: maps test names to parent keys (class or method)
//! - **Registry**: parent records created so far, with rerun revisions
//! - **Session**: the consumer task and the two-phase flush
//! - **Tracker**: the remote service boundary (shell command, or in memory)
//! - **Run**: run resolution and the run-id checkpoint file
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use runfeed::config::load_config;
//! use runfeed::result::{ObservedResult, RunComplete, TestOutcome};
//! use runfeed::run::open_run;
//! use runfeed::session::ReportingSession;
//! use runfeed::tracker::shell::ShellTracker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("runfeed.toml"))?;
//!     let tracker = Arc::new(ShellTracker::new("./tracker.py"));
//!
//!     let request = config.run.run_request(None, false);
//!     let run = open_run(tracker.as_ref(), config.run_metadata(), &request, &config.checkpoint())
//!         .await?;
//!
//!     let session = ReportingSession::start(tracker, run, config.session_options());
//!     session.enqueue(ObservedResult::new("Ns.Tests.Adds", TestOutcome::Passed));
//!     session.flush(RunComplete::completed()).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod events;
pub mod grouping;
pub mod queue;
pub mod registry;
pub mod report;
pub mod result;
pub mod run;
pub mod session;
pub mod tracker;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use result::{ObservedResult, RunComplete, TestOutcome};
pub use run::{RunHandle, RunId, open_run};
pub use session::{FlushError, FlushReport, ReportingSession, ResultSink, SessionOptions};
pub use tracker::{RunTracker, TrackerError};
