//! Common utilities and shared types for relay.
//!
//! This crate provides foundational components used across all relay crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Process manifest**: Deployment descriptor parsing via [`ProcessManifest`]
//! - **Environment**: Injected `env_variables` via [`Environment`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID-based unique identifiers via [`IdGenerator`]
//! - **Metrics**: Per-queue dispatch counters via [`Metrics`]
//!
//! # Example
//!
//! ```no_run
//! use relay_common::{AppResult, Config, IdGenerator};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     let id = id_gen.generate();
//!     println!("Generated ID: {} for {}", id, config.server.host);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod manifest;
pub mod metrics;

pub use config::{Config, DispatcherConfig, ServerConfig};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
pub use manifest::{Bind, Entrypoint, Environment, PortSpec, ProcessManifest};
pub use metrics::{Metrics, QueueMetrics, QueueMetricsSnapshot};
