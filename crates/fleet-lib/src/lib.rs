//! Load fleet library
//!
//! This crate provides the core functionality for:
//! - Agent liveness monitoring over a remote control channel
//! - Capacity validation of allocation plans
//! - Execution orchestration and result ingestion
//! - Sweep scheduling, persistence and scenario file storage
//! - Health checks and observability

pub mod capacity;
pub mod channel;
pub mod error;
pub mod health;
pub mod models;
pub mod monitor;
pub mod objects;
pub mod observability;
pub mod orchestrator;
pub mod results;
pub mod scheduler;
pub mod store;

pub use error::{ErrorKind, FleetError, PipelineStage, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{FleetMetrics, StructuredLogger};
