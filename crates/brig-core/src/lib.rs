//! # brig-core
//!
//! Namespace jail lifecycle and per-connection worker primitives.
//!
//! This crate provides:
//! - An ephemeral tmpfs root, entered through clone3 namespaces and pivot_root
//! - Mount-table reconciliation, capability and privilege drop
//! - A per-connection worker that relays a NUL-terminated request into a
//!   resource-limited payload process and its output back to the client
//! - Wait, terminate and signal-latch helpers shared by the daemon and CLI

#![allow(clippy::module_name_repetitions)]

pub mod capture;
pub mod config;
pub mod error;
pub mod isolation;
pub mod jail;
pub mod pipe;
pub mod process;
pub mod protocol;
pub mod result;
pub mod signals;
pub mod sys;
pub mod worker;

pub use config::JailConfig;
pub use error::BrigError;
pub use jail::{Jail, Staging, Workload};
pub use result::PayloadOutcome;
pub use worker::WorkerSettings;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, BrigError>;
