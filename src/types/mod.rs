//! Core types for the Kite runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **Router**: `(type, id)` service addresses and shard hashing
//! - **IDs**: Strongly-typed identifiers (InstanceId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for workers and observability

mod config;
mod errors;
mod ids;
mod router;

pub use config::{Config, ObservabilityConfig, RuntimeConfig};
pub use errors::{Error, Result};
pub use ids::InstanceId;
pub use router::{hash_router, shard, Router, RouterId};
