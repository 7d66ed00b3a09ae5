//! Shared types and utilities for Vigil
//!
//! This crate contains the lifecycle events, health payloads and persisted
//! alerting records exchanged between the management plane, the agents and
//! the alerting service.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{health::*, state::*, watch::*};
