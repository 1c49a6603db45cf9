//! Run handles and run resolution.
//!
//! A reporting session always reports against one remote run. Which run is
//! decided once, before the session starts, by [`open_run`]:
//!
//! 1. an explicit run id (e.g. passed by a pipeline step that created it),
//! 2. the [checkpoint](checkpoint::RunCheckpoint) left by an earlier
//!    invocation, when this invocation is a rerun,
//! 3. a freshly created run, only for single-agent jobs. Multi-agent jobs
//!    must share a run created up front, so guessing here would split their
//!    results across several runs.

pub mod checkpoint;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

pub use checkpoint::{CheckpointError, RunCheckpoint};
pub use crate::tracker::RunId;

use crate::tracker::{RunTracker, TrackerError};

/// Run-level metadata sent when creating a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunMetadata {
    pub name: String,
    pub agent_name: String,
    pub job_name: String,
    pub build_id: Option<i64>,
    pub release_uri: Option<String>,
    pub requested_for: Option<String>,
    /// Namespace prefix stripped from test names when grouping.
    pub source: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RunMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_name: String::new(),
            job_name: String::new(),
            build_id: None,
            release_uri: None,
            requested_for: None,
            source: None,
            started_at: Utc::now(),
        }
    }
}

/// How this session came to hold its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOwnership {
    /// This session created the run and is responsible for completing it.
    Created,
    /// The run was created elsewhere; another step completes it.
    Attached,
}

/// Remote state of the run as far as this session knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    InProgress,
    Completed,
    Aborted,
}

/// The remote run a session reports against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: RunId,
    pub metadata: RunMetadata,
    pub ownership: RunOwnership,
    state: RunState,
}

impl RunHandle {
    pub fn new(id: RunId, metadata: RunMetadata, ownership: RunOwnership) -> Self {
        Self {
            id,
            metadata,
            ownership,
            state: RunState::InProgress,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    // Only the flush protocol finalizes a run.
    pub(crate) fn mark_finished(&mut self, aborted: bool) {
        self.state = if aborted {
            RunState::Aborted
        } else {
            RunState::Completed
        };
    }
}

/// Inputs that decide which run to report against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub explicit_id: Option<RunId>,
    /// Reuse the run recorded in the checkpoint file.
    pub rerun: bool,
    /// 1-based position of this agent in a multi-agent job.
    pub agent_number: u32,
    pub total_agents: u32,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            explicit_id: None,
            rerun: false,
            agent_number: 1,
            total_agents: 1,
        }
    }
}

impl RunRequest {
    pub fn is_single_agent(&self) -> bool {
        self.agent_number <= 1 && self.total_agents <= 1
    }
}

/// Errors resolving the run for a session.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(
        "No run id for agent {agent_number} of {total_agents}; create the run first and pass its id"
    )]
    NoRunForAgent { agent_number: u32, total_agents: u32 },

    #[error("Failed to create run: {0}")]
    Create(#[from] TrackerError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Picks the run to report against, creating one if this job may.
///
/// The checkpoint is read at most once (only for reruns without an
/// explicit id) and written once, after a run is created.
pub async fn open_run(
    tracker: &dyn RunTracker,
    metadata: RunMetadata,
    request: &RunRequest,
    checkpoint: &RunCheckpoint,
) -> Result<RunHandle, RunError> {
    if let Some(id) = request.explicit_id {
        info!("Attaching to run {}", id);
        return Ok(RunHandle::new(id, metadata, RunOwnership::Attached));
    }

    if request.rerun {
        if let Some(id) = checkpoint.load()? {
            info!(
                "Attaching to run {} from {}",
                id,
                checkpoint.path().display()
            );
            return Ok(RunHandle::new(id, metadata, RunOwnership::Attached));
        }
        info!(
            "No run recorded in {}, creating a new one",
            checkpoint.path().display()
        );
    }

    if !request.is_single_agent() {
        return Err(RunError::NoRunForAgent {
            agent_number: request.agent_number,
            total_agents: request.total_agents,
        });
    }

    let id = tracker.create_run(&metadata).await?;
    info!("Created run {} on {}", id, tracker.name());
    checkpoint.store(id)?;

    Ok(RunHandle::new(id, metadata, RunOwnership::Created))
}
