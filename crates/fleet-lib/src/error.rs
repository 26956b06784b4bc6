//! Error taxonomy shared by the fleet components

use crate::channel::ChannelError;
use crate::models::{AgentId, AgentStatus};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub type Result<T, E = FleetError> = std::result::Result<T, E>;

/// Stage of the execution pipeline an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Materialize,
    Deploy,
    Launch,
    Monitor,
    Collect,
    Finalize,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Materialize => "materialize",
            PipelineStage::Deploy => "deploy",
            PipelineStage::Launch => "launch",
            PipelineStage::Monitor => "monitor",
            PipelineStage::Collect => "collect",
            PipelineStage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    /// Structural or capacity violation in a plan or request
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    #[error("remote host unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("remote authentication failed: {0}")]
    RemoteAuth(String),

    #[error("{stage} stage failed: {message}")]
    Pipeline {
        stage: PipelineStage,
        message: String,
    },

    /// Start/stop attempted from an ineligible state
    #[error("{0}")]
    Guard(String),

    #[error("agent {agent_id} is not online (status: {status})")]
    AgentUnavailable {
        agent_id: AgentId,
        status: AgentStatus,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by transports to pick a response code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Rejected,
    Remote,
    Internal,
}

impl FleetError {
    pub fn not_found(kind: &'static str, id: u64) -> Self {
        FleetError::NotFound { kind, id }
    }

    pub fn pipeline(stage: PipelineStage, message: impl fmt::Display) -> Self {
        FleetError::Pipeline {
            stage,
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::NotFound { .. } => ErrorKind::NotFound,
            FleetError::Validation(_)
            | FleetError::Guard(_)
            | FleetError::AgentUnavailable { .. } => ErrorKind::Rejected,
            FleetError::RemoteUnreachable(_)
            | FleetError::RemoteAuth(_)
            | FleetError::Pipeline { .. } => ErrorKind::Remote,
            FleetError::Storage(_) | FleetError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<ChannelError> for FleetError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Auth(msg) => FleetError::RemoteAuth(msg),
            ChannelError::Unreachable(msg) => FleetError::RemoteUnreachable(msg),
            ChannelError::Timeout(_) => FleetError::RemoteUnreachable(err.to_string()),
            other => FleetError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_kinds() {
        assert_eq!(FleetError::not_found("execution", 7).kind(), ErrorKind::NotFound);
        assert_eq!(FleetError::Guard("no".into()).kind(), ErrorKind::Rejected);
        assert_eq!(
            FleetError::AgentUnavailable {
                agent_id: 1,
                status: AgentStatus::Offline
            }
            .kind(),
            ErrorKind::Rejected
        );
        assert_eq!(
            FleetError::pipeline(PipelineStage::Deploy, "disk full").kind(),
            ErrorKind::Remote
        );
    }

    #[test]
    fn test_channel_error_mapping() {
        let err: FleetError = ChannelError::Auth("bad key".into()).into();
        assert!(matches!(err, FleetError::RemoteAuth(_)));

        let err: FleetError = ChannelError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(err, FleetError::RemoteUnreachable(_)));
    }

    #[test]
    fn test_messages_name_the_subject() {
        assert_eq!(
            FleetError::not_found("agent", 3).to_string(),
            "agent 3 not found"
        );
        assert_eq!(
            FleetError::pipeline(PipelineStage::Launch, "exit code 127").to_string(),
            "launch stage failed: exit code 127"
        );
    }
}
