//! Configuration loading for runfeed.
//!
//! Configuration comes from a TOML file (see [`schema`]) plus, for run
//! metadata, the CI environment. The file always wins; the environment only
//! fills what the file leaves unset.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::grouping::ResultGrouper;
use crate::run::{RunCheckpoint, RunId, RunMetadata, RunRequest};
use crate::session::{FlushTimeouts, SessionOptions};

/// Commented starter configuration written by `runfeed init`.
pub const EXAMPLE_CONFIG: &str = r#"# runfeed configuration file

[session]
drain_timeout_secs = 60
finalize_timeout_secs = 60
abort_timeout_secs = 10
max_deferrals = 3

[grouping]
group_by_class = true
# Namespace prefix stripped from test names before grouping
# source = "MyCompany.Tests"
rerun_policy = "latest-only"

[run]
# name = "unit tests"
checkpoint = "testrunid.txt"
complete_attached_run = false

[tracker]
type = "log"
# type = "shell"
# command = "./scripts/tracker.py"
# timeout_secs = 120
"#;

/// Loads configuration from a TOML file.
///
/// # Example
///
/// ```no_run
/// use runfeed::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("runfeed.toml"))?;
/// println!("Drain timeout: {}s", config.session.drain_timeout_secs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use runfeed::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [session]
///     drain_timeout_secs = 5
/// "#)?;
///
/// assert_eq!(config.session.drain_timeout_secs, 5);
/// assert_eq!(config.session.abort_timeout_secs, 10);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

impl Config {
    /// Checks values serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.session.drain_timeout_secs == 0 {
            bail!("session.drain_timeout_secs must be greater than 0");
        }
        if self.session.finalize_timeout_secs == 0 {
            bail!("session.finalize_timeout_secs must be greater than 0");
        }

        if let TrackerConfig::Shell {
            command,
            timeout_secs,
            ..
        } = &self.tracker
        {
            let parts = shell_words::split(command).with_context(|| {
                format!("tracker.command is not a valid command line: {}", command)
            })?;
            if parts.is_empty() {
                bail!("tracker.command must not be empty");
            }
            if *timeout_secs == 0 {
                bail!("tracker.timeout_secs must be greater than 0");
            }
        }

        if let (Some(number), Some(total)) = (self.run.agent_number, self.run.total_agents) {
            if number == 0 || number > total {
                bail!("run.agent_number must be between 1 and run.total_agents ({})", total);
            }
        }

        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        let mut grouper = ResultGrouper::new(self.grouping.group_by_class);
        if let Some(source) = &self.grouping.source {
            grouper = grouper.with_source(source.as_str());
        }

        SessionOptions {
            grouper,
            rerun_policy: self.grouping.rerun_policy,
            max_deferrals: self.session.max_deferrals,
            timeouts: FlushTimeouts {
                drain: Duration::from_secs(self.session.drain_timeout_secs),
                finalize: Duration::from_secs(self.session.finalize_timeout_secs),
                abort: Duration::from_secs(self.session.abort_timeout_secs),
            },
            complete_attached_run: self.run.complete_attached_run,
        }
    }

    /// Run metadata; the grouping source doubles as the default run name.
    pub fn run_metadata(&self) -> RunMetadata {
        let source = self.grouping.source.clone().filter(|s| !s.is_empty());
        let name = self
            .run
            .name
            .clone()
            .or_else(|| source.clone())
            .unwrap_or_else(|| "Test run".to_string());

        let mut metadata = RunMetadata::new(name);
        metadata.agent_name = self.run.agent_name.clone().unwrap_or_default();
        metadata.job_name = self.run.job_name.clone().unwrap_or_default();
        metadata.build_id = self.run.build_id;
        metadata.release_uri = self.run.release_uri.clone();
        metadata.requested_for = self.run.requested_for.clone();
        metadata.source = source;
        metadata
    }

    pub fn checkpoint(&self) -> RunCheckpoint {
        let path = shellexpand::tilde(&self.run.checkpoint.to_string_lossy()).into_owned();
        RunCheckpoint::new(PathBuf::from(path))
    }
}

impl RunConfig {
    /// Fills unset metadata from CI variables read through `lookup`.
    ///
    /// ```
    /// use runfeed::config::RunConfig;
    ///
    /// let mut run = RunConfig::default();
    /// run.apply_env(|key| match key {
    ///     "AGENT_NAME" => Some("agent-7".to_string()),
    ///     "SYSTEM_TOTALJOBSINPHASE" => Some("3".to_string()),
    ///     _ => None,
    /// });
    /// assert_eq!(run.agent_name.as_deref(), Some("agent-7"));
    /// assert_eq!(run.total_agents, Some(3));
    /// ```
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if self.agent_name.is_none() {
            self.agent_name = text("AGENT_NAME");
        }
        if self.job_name.is_none() {
            self.job_name = text("AGENT_JOBNAME");
        }
        if self.build_id.is_none() {
            self.build_id = text("BUILD_BUILDID").and_then(|v| v.trim().parse().ok());
        }
        if self.requested_for.is_none() {
            self.requested_for = text("BUILD_REQUESTEDFOR");
        }
        if self.release_uri.is_none() {
            self.release_uri = text("RELEASE_RELEASEURI");
        }
        if self.agent_number.is_none() {
            self.agent_number =
                text("SYSTEM_JOBPOSITIONINPHASE").and_then(|v| v.trim().parse().ok());
        }
        if self.total_agents.is_none() {
            self.total_agents =
                text("SYSTEM_TOTALJOBSINPHASE").and_then(|v| v.trim().parse().ok());
        }
    }

    pub fn run_request(&self, explicit_id: Option<RunId>, rerun: bool) -> RunRequest {
        RunRequest {
            explicit_id,
            rerun,
            agent_number: self.agent_number.unwrap_or(1),
            total_agents: self.total_agents.unwrap_or(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::grouping::RerunPolicy;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();

        assert_eq!(config.session.drain_timeout_secs, 60);
        assert_eq!(config.session.finalize_timeout_secs, 60);
        assert_eq!(config.session.abort_timeout_secs, 10);
        assert_eq!(config.session.max_deferrals, 3);
        assert!(config.grouping.group_by_class);
        assert_eq!(config.run.checkpoint, PathBuf::from("testrunid.txt"));
        assert!(matches!(config.tracker, TrackerConfig::Log));
        config.validate().unwrap();
    }

    #[test]
    fn test_example_config_parses() {
        let config = load_config_str(EXAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let config = load_config_str(
            r#"
            [session]
            drain_timeout_secs = 5
            max_deferrals = 0

            [grouping]
            group_by_class = false
            source = "Foo"
            rerun_policy = "preserve-first-failure"

            [run]
            name = "nightly"
            build_id = 1234
            agent_number = 2
            total_agents = 3
            complete_attached_run = true

            [tracker]
            type = "shell"
            command = "python3 'my tracker.py'"
            timeout_secs = 30
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let options = config.session_options();
        assert_eq!(options.timeouts.drain, Duration::from_secs(5));
        assert_eq!(options.max_deferrals, 0);
        assert_eq!(options.rerun_policy, RerunPolicy::PreserveFirstFailure);
        assert!(!options.grouper.groups_by_class());
        assert_eq!(options.grouper.source(), Some("Foo"));
        assert!(options.complete_attached_run);

        let metadata = config.run_metadata();
        assert_eq!(metadata.name, "nightly");
        assert_eq!(metadata.build_id, Some(1234));
        assert_eq!(metadata.source.as_deref(), Some("Foo"));

        let request = config.run.run_request(None, false);
        assert_eq!((request.agent_number, request.total_agents), (2, 3));
        assert!(!request.is_single_agent());

        match config.tracker {
            TrackerConfig::Shell { timeout_secs, .. } => assert_eq!(timeout_secs, 30),
            TrackerConfig::Log => panic!("expected shell tracker"),
        }
    }

    #[test]
    fn test_run_name_falls_back_to_source() {
        let config = load_config_str("[grouping]\nsource = \"Contoso.Tests\"").unwrap();
        assert_eq!(config.run_metadata().name, "Contoso.Tests");
        assert_eq!(load_config_str("").unwrap().run_metadata().name, "Test run");
    }

    #[test]
    fn test_env_fills_only_unset_fields() {
        let env: HashMap<&str, &str> = [
            ("AGENT_NAME", "agent-1"),
            ("AGENT_JOBNAME", "Job 1"),
            ("BUILD_BUILDID", "99"),
            ("BUILD_REQUESTEDFOR", "Dana"),
            ("RELEASE_RELEASEURI", "vstfs:///ReleaseManagement/Release/1"),
            ("SYSTEM_JOBPOSITIONINPHASE", "2"),
            ("SYSTEM_TOTALJOBSINPHASE", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut run = load_config_str("[run]\nbuild_id = 5").unwrap().run;
        run.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(run.agent_name.as_deref(), Some("agent-1"));
        assert_eq!(run.job_name.as_deref(), Some("Job 1"));
        assert_eq!(run.build_id, Some(5));
        assert_eq!(run.requested_for.as_deref(), Some("Dana"));
        assert_eq!(run.agent_number, Some(2));
        assert_eq!(run.total_agents, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = load_config_str("[tracker]\ntype = \"shell\"\ncommand = \"\"").unwrap();
        assert!(config.validate().is_err());

        let config = load_config_str("[run]\nagent_number = 4\ntotal_agents = 3").unwrap();
        assert!(config.validate().is_err());

        let config = load_config_str("[session]\ndrain_timeout_secs = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_tracker_type_is_an_error() {
        assert!(load_config_str("[tracker]\ntype = \"carrier-pigeon\"").is_err());
    }
}
