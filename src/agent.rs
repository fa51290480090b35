use std::path::PathBuf;

use crate::config::Config;
use crate::{Error, Result};

string_id!(
    /// Identity of a worker process, stable across restarts.
    AgentId
);

/// Command line used to launch a worker CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    base_command: Vec<String>,
}

impl WorkerCommand {
    /// Split a shell-style command string on whitespace.
    pub fn parse(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
        }
    }

    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            base_command: parts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::parse(config.worker.effective_command())
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or(crate::config::DEFAULT_WORKER_COMMAND)
    }

    pub fn args(&self) -> &[String] {
        self.base_command.get(1..).unwrap_or(&[])
    }

    /// Full argv with an optional trailing argument.
    pub fn command(&self, extra: Option<&str>) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        if let Some(arg) = extra {
            cmd.push(arg.to_string());
        }
        cmd
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Locate the binary on `PATH`.
    pub fn resolve(&self, agent: &AgentId) -> Result<PathBuf> {
        if self.base_command.is_empty() {
            return Err(Error::ProcessCreationFailed {
                agent: agent.clone(),
                reason: "empty worker command".to_string(),
            });
        }
        which::which(self.binary()).map_err(|e| Error::ProcessCreationFailed {
            agent: agent.clone(),
            reason: format!("{}: {}", self.binary(), e),
        })
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
