//! # Kite - In-Process Actor-Style Service Runtime
//!
//! Kite hosts addressable services on a pool of worker threads:
//! - Services are addressed by [`Router`] `(type, id)` and owned by the
//!   worker selected by `hash(router) mod workers`
//! - Full mesh of channels between workers with request/response sessions,
//!   including streamed responses
//! - Service and component lifecycle with keep-alive caching and a creation
//!   queue for concurrent creates
//! - Dependency-ordered boot and coordinated shutdown
//! - Onion-style middleware pipelines, global and per service
//! - Local and global events, one-shot and interval timers
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────────────────────────────┐
//!   Kite::fetch  →   │ worker 0          worker 1        ... │
//!                    │ ┌──────────┐      ┌──────────┐        │
//!                    │ │ services │ ◀──▶ │ services │        │
//!                    │ │ pipeline │ mesh │ pipeline │        │
//!                    │ │ sessions │      │ sessions │        │
//!                    │ └──────────┘      └──────────┘        │
//!                    └───────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use kite::{Kite, Module, Request, Router, ServiceDefinition};
//!
//! # async fn run() -> kite::Result<()> {
//! let mut kite = Kite::new();
//! kite.regist(Module::new("demo").service(
//!     "echo",
//!     ServiceDefinition::new()
//!         .auto_create(true)
//!         .handler("hello", |_cx, _event| async { Ok("world") }),
//! ))?;
//! kite.start(Some(2)).await?;
//!
//! let response = kite
//!     .fetch(Request::fetch(Router::new("echo", "a"), "handlers/hello"))
//!     .await;
//! assert_eq!(response.status, 200);
//!
//! kite.stop().await?;
//! # Ok(())
//! # }
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

// Re-export public API
pub mod commbus;
pub mod definition;
pub mod dependency;
pub mod envelope;
pub mod ipc;
pub mod kernel;
pub mod middleware;
pub mod types;

// Internal utilities
pub mod observability;

pub use definition::{
    BootDefinition, ComponentDefinition, CreateInfo, MiddlewareDefinition, Module,
    ServiceDefinition, ServiceRuntime, TimerDefinition,
};
pub use envelope::{Body, BodyStream, Event, Method, Request, Response, StreamSender};
pub use kernel::{
    Kernel, Kite, MiddlewareContext, Resource, RuntimeError, ServiceContext, ServiceRef,
    ServiceState,
};
pub use middleware::Next;
pub use types::{Config, Error, Result, Router};
