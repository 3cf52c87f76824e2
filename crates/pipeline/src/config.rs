use std::path::PathBuf;
use std::time::Duration;

use crate::execution::DEFAULT_OUTPUT_LIMIT;
use crate::shell::{DEFAULT_DOCKER, DEFAULT_SHELL};
use crate::store::RetentionPolicy;

/// Tracker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Jenkins-style home whose `jobs/` tree is loaded at startup. When
    /// unset the registry starts empty.
    pub jobs_home: Option<PathBuf>,
    /// How long finished executions stay queryable (default: `3600`).
    pub retention_secs: u64,
    /// Upper bound on retained finished executions (default: `1000`).
    pub max_retained: usize,
    /// How often the retention sweep runs (default: `60`).
    pub eviction_interval_secs: u64,
    /// Interpreter used by the shell runner (default: `sh`).
    pub runner_shell: String,
    /// Per-execution runner time limit. Unlimited when unset.
    pub runner_timeout_secs: Option<u64>,
    /// Container CLI used for `docker` pipeline agents (default: `docker`).
    pub runner_docker: String,
    /// Output events kept per execution before lines are dropped
    /// (default: `10000`).
    pub max_output_events: usize,
}

impl TrackerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default  |
    /// |--------------------------|----------|
    /// | `JOBS_HOME`              | (unset)  |
    /// | `RETENTION_SECS`         | `3600`   |
    /// | `MAX_RETAINED`           | `1000`   |
    /// | `EVICTION_INTERVAL_SECS` | `60`     |
    /// | `RUNNER_SHELL`           | `sh`     |
    /// | `RUNNER_TIMEOUT_SECS`    | (unset)  |
    /// | `RUNNER_DOCKER`          | `docker` |
    /// | `MAX_OUTPUT_EVENTS`      | `10000`  |
    pub fn from_env() -> Self {
        let jobs_home = std::env::var("JOBS_HOME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let retention_secs: u64 = std::env::var("RETENTION_SECS")
            .unwrap_or_else(|_| "3600".into())
            .parse()
            .expect("RETENTION_SECS must be a valid u64");

        let max_retained: usize = std::env::var("MAX_RETAINED")
            .unwrap_or_else(|_| "1000".into())
            .parse()
            .expect("MAX_RETAINED must be a valid usize");

        let eviction_interval_secs: u64 = std::env::var("EVICTION_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".into())
            .parse()
            .expect("EVICTION_INTERVAL_SECS must be a valid u64");

        let runner_shell = std::env::var("RUNNER_SHELL").unwrap_or_else(|_| DEFAULT_SHELL.into());

        let runner_timeout_secs: Option<u64> = std::env::var("RUNNER_TIMEOUT_SECS").ok().map(|v| {
            v.parse()
                .expect("RUNNER_TIMEOUT_SECS must be a valid u64")
        });

        let runner_docker =
            std::env::var("RUNNER_DOCKER").unwrap_or_else(|_| DEFAULT_DOCKER.into());

        let max_output_events: usize = std::env::var("MAX_OUTPUT_EVENTS")
            .unwrap_or_else(|_| DEFAULT_OUTPUT_LIMIT.to_string())
            .parse()
            .expect("MAX_OUTPUT_EVENTS must be a valid usize");

        Self {
            jobs_home,
            retention_secs,
            max_retained,
            eviction_interval_secs,
            runner_shell,
            runner_timeout_secs,
            runner_docker,
            max_output_events,
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retain_for: chrono::Duration::seconds(self.retention_secs as i64),
            max_retained: self.max_retained,
        }
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }

    pub fn runner_timeout(&self) -> Option<Duration> {
        self.runner_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            jobs_home: None,
            retention_secs: 3600,
            max_retained: 1000,
            eviction_interval_secs: 60,
            runner_shell: DEFAULT_SHELL.into(),
            runner_timeout_secs: None,
            runner_docker: DEFAULT_DOCKER.into(),
            max_output_events: DEFAULT_OUTPUT_LIMIT,
        }
    }
}
