//! Load Fleet server: HTTP API over the fleet library

pub mod api;
pub mod config;
