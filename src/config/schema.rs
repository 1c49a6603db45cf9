//! Configuration schema for runfeed.
//!
//! All sections are optional. An empty file is a valid configuration that
//! reports to the log tracker with default timeouts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::grouping::RerunPolicy;
use crate::run::checkpoint::DEFAULT_CHECKPOINT_FILE;

/// Root configuration structure.
///
/// # Example
///
/// ```
/// use runfeed::config::{load_config_str, TrackerConfig};
///
/// let config = load_config_str(r#"
///     [grouping]
///     source = "Foo"
///
///     [tracker]
///     type = "shell"
///     command = "python3 tracker.py"
/// "#).unwrap();
///
/// assert_eq!(config.grouping.source.as_deref(), Some("Foo"));
/// assert!(matches!(config.tracker, TrackerConfig::Shell { .. }));
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Flush timeouts and deferral limits.
    #[serde(default)]
    pub session: SessionConfig,

    /// How results are grouped under parent records.
    #[serde(default)]
    pub grouping: GroupingConfig,

    /// Run metadata and run resolution.
    #[serde(default)]
    pub run: RunConfig,

    /// Which tracker receives the results.
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// Reporting session settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `drain_timeout_secs` | 60 |
/// | `finalize_timeout_secs` | 60 |
/// | `abort_timeout_secs` | 10 |
/// | `max_deferrals` | 3 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// How long flush waits for queued results to be forwarded.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// How long flush waits for run attachments and run completion.
    #[serde(default = "default_finalize_timeout")]
    pub finalize_timeout_secs: u64,

    /// How long flush waits after aborting in-flight tracker calls.
    #[serde(default = "default_abort_timeout")]
    pub abort_timeout_secs: u64,

    /// How many later batches a result may wait for its parent record
    /// before it is dropped.
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
            finalize_timeout_secs: default_finalize_timeout(),
            abort_timeout_secs: default_abort_timeout(),
            max_deferrals: default_max_deferrals(),
        }
    }
}

fn default_drain_timeout() -> u64 {
    60
}

fn default_finalize_timeout() -> u64 {
    60
}

fn default_abort_timeout() -> u64 {
    10
}

fn default_max_deferrals() -> u32 {
    3
}

/// Result grouping.
///
/// ```toml
/// [grouping]
/// group_by_class = true
/// source = "Contoso.Tests"
/// rerun_policy = "preserve-first-failure"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupingConfig {
    /// Group methods of one class under a single parent. When off, every
    /// method gets its own parent.
    #[serde(default = "default_true")]
    pub group_by_class: bool,

    /// Namespace prefix stripped from test names before grouping.
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub rerun_policy: RerunPolicy,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            group_by_class: true,
            source: None,
            rerun_policy: RerunPolicy::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Run metadata and run resolution.
///
/// Metadata left unset here is filled from CI environment variables, see
/// [`RunConfig::apply_env`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Run name. Defaults to the grouping source, then "Test run".
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub agent_name: Option<String>,

    #[serde(default)]
    pub job_name: Option<String>,

    #[serde(default)]
    pub build_id: Option<i64>,

    #[serde(default)]
    pub release_uri: Option<String>,

    #[serde(default)]
    pub requested_for: Option<String>,

    /// File the created run id is written to, and read from on reruns.
    #[serde(default = "default_checkpoint")]
    pub checkpoint: PathBuf,

    /// 1-based position of this agent in a multi-agent job.
    #[serde(default)]
    pub agent_number: Option<u32>,

    #[serde(default)]
    pub total_agents: Option<u32>,

    /// Complete the run even when this invocation did not create it.
    #[serde(default)]
    pub complete_attached_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: None,
            agent_name: None,
            job_name: None,
            build_id: None,
            release_uri: None,
            requested_for: None,
            checkpoint: default_checkpoint(),
            agent_number: None,
            total_agents: None,
            complete_attached_run: false,
        }
    }
}

fn default_checkpoint() -> PathBuf {
    PathBuf::from(DEFAULT_CHECKPOINT_FILE)
}

/// Tracker selection, tagged by `type`.
///
/// | Type | Description |
/// |------|-------------|
/// | `shell` | External command speaking the JSON protocol in [`crate::tracker::shell`] |
/// | `log` | Logs every call and assigns sequential ids; nothing leaves the machine |
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrackerConfig {
    Shell {
        /// Command line; the operation name is appended as the last argument.
        command: String,

        #[serde(default)]
        working_dir: Option<PathBuf>,

        /// Timeout for each tracker call.
        #[serde(default = "default_tracker_timeout")]
        timeout_secs: u64,
    },

    #[default]
    Log,
}

fn default_tracker_timeout() -> u64 {
    120
}
