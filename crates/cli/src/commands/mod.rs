//! Subcommand implementations

pub mod agents;
pub mod executions;
pub mod heartbeat;
pub mod plans;
