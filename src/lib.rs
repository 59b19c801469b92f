//! `scribe-router`: health-aware routing of transcription jobs across heterogeneous backends.
//!
//! This crate provides:
//! - A uniform adapter contract over cloud, local-process and container backends
//! - A job registry that is the single source of truth for what is running
//! - A health monitor with an explicit start/stop lifecycle
//! - Deduplicated, severity-tagged alerts with optional webhook forwarding
//! - A request router that walks a priority- and health-ordered fallback chain
//!
//! The library is designed to be embedded in long-running services; the bundled binaries
//! are thin wrappers that map flags into [`config::Config`].

// High-level API (most consumers should start here).
pub mod config;
pub mod router;

// Requests, results and the jobs that produce them.
pub mod job;
pub mod job_registry;
pub mod opts;
pub mod request;
pub mod transcript;

// Backend contract and the built-in adapters.
pub mod backend;
pub mod backend_registry;
pub mod backends;

// Health, host metrics and alerting.
pub mod alerts;
pub mod health;
pub mod monitor;
pub mod system;

pub mod clock;
mod error;

// Shared helpers for the bundled binaries.
#[cfg(feature = "cli")]
pub mod cli;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

#[cfg(feature = "logging")]
pub use crate::logging::init as init_logging;

pub use crate::backend::{Backend, BackendKind};
pub use crate::backend_registry::BackendRegistry;
pub use crate::config::Config;
pub use crate::error::{ContainerAction, Error, Result};
pub use crate::monitor::HealthMonitor;
pub use crate::request::{Method, Priority, Task, TranscriptionRequest};
pub use crate::router::RequestRouter;
pub use crate::transcript::TranscriptionResult;
