use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// How often, and how eagerly, an exited process is brought back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
    /// Pause between an exit and the next spawn attempt.
    pub backoff: Duration,
}

impl RestartPolicy {
    pub fn unlimited(backoff: Duration) -> Self {
        Self {
            max_restarts: None,
            backoff,
        }
    }

    /// Whether another restart is permitted after `restarts` have already happened.
    pub fn allows(&self, restarts: u32) -> bool {
        self.max_restarts.is_none_or(|max| restarts < max)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::unlimited(Duration::from_secs(1))
    }
}

/// Everything needed to (re)spawn the supervised process.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Merged over the parent's environment.
    pub env: Vec<(String, String)>,
    pub restart: RestartPolicy,
    /// Run the child in its own process group and signal the whole group on stop.
    pub kill_tree: bool,
    /// Time allowed between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl MonitorConfig {
    /// Build a config from a full command line; the first element is the program.
    pub fn new<I, S>(command_line: I) -> Result<Self, MonitorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = command_line.into_iter().map(Into::into);
        let program = parts.next().ok_or(MonitorError::EmptyCommand)?;
        Ok(Self {
            program: PathBuf::from(program),
            args: parts.collect(),
            working_dir: None,
            env: Vec::new(),
            restart: RestartPolicy::default(),
            kill_tree: true,
            stop_grace: Duration::from_secs(5),
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Lifecycle notifications broadcast to every subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// First successful spawn of a run.
    Start { pid: Option<u32> },
    /// Respawn after an unexpected exit or a failed spawn.
    Restart { pid: Option<u32>, attempt: u32 },
    Error { message: String },
    Exit { code: Option<i32> },
    /// Teardown requested through `stop` has completed.
    Stop,
    /// Restart budget exhausted; the monitor is idle.
    GaveUp { restarts: u32 },
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("command line is empty")]
    EmptyCommand,
    #[error("process monitor is already running")]
    AlreadyRunning,
    #[error("failed to spawn {program:?}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}
