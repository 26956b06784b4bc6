//! Remote control channel
//!
//! Short-lived sessions to an agent for running commands and moving files.
//! A session is opened per logical operation (probe, deploy, launch, fetch),
//! never pooled and never shared between agents. The channel does not retry;
//! callers decide what a failure means.

mod ssh;

#[cfg(any(test, feature = "testing"))]
pub mod scripted;

pub use ssh::{HostKeyPolicy, SshConnector};

use crate::models::{Agent, Credentials};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Exit code the file fetch command uses to signal a missing file
pub(crate) const MISSING_FILE_EXIT_CODE: u32 = 44;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote file not found: {0}")]
    NotFound(String),

    #[error("remote command failed: {0}")]
    Command(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Command execution result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn failed(exit_code: u32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }
}

/// Where and as whom to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: Credentials,
}

impl RemoteTarget {
    /// Build a target for an agent; `None` when no credentials are configured
    pub fn for_agent(agent: &Agent) -> Option<Self> {
        agent.credentials().map(|credentials| Self {
            host: agent.host.clone(),
            port: agent.port,
            username: agent.username.clone(),
            credentials,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opens sessions to remote agents
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        target: &RemoteTarget,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ChannelError>;
}

/// An open session to one agent
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput, ChannelError>;

    async fn put_file(&self, bytes: &[u8], remote_path: &str) -> Result<(), ChannelError>;

    /// Fails with [`ChannelError::NotFound`] when the file does not exist
    async fn get_file(&self, remote_path: &str) -> Result<Vec<u8>, ChannelError>;

    async fn close(self: Box<Self>) -> Result<(), ChannelError>;
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Directory part of a remote path, if any
pub(crate) fn parent_dir(remote_path: &str) -> Option<&str> {
    match remote_path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&remote_path[..idx]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Capacity;

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::ok("hello").success());
        assert!(!CommandOutput::failed(1, "error").success());
        assert!(!CommandOutput::default().success());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b.py"), "'/tmp/a b.py'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/tmp/locust_script_1.py"), Some("/tmp"));
        assert_eq!(parent_dir("/script.py"), None);
        assert_eq!(parent_dir("script.py"), None);
    }

    #[test]
    fn test_target_requires_credentials() {
        let mut agent = Agent::new("gen-1", "10.0.0.5", "locust", Capacity::default());
        assert!(RemoteTarget::for_agent(&agent).is_none());

        agent.password = Some("pw".into());
        agent.port = 2222;
        let target = RemoteTarget::for_agent(&agent).unwrap();
        assert_eq!(target.address(), "10.0.0.5:2222");
        assert_eq!(target.username, "locust");
    }
}
