//! Quota-gated document generation with dual-path job tracking.
//!
//! Submissions pass through the [`usage`] validator before a request is
//! created. Each accepted request is then tracked by a poll loop and a
//! per-scope push subscription; the [`tracker`] reconciles both into the
//! [`registry`] and materializes finished documents.

pub mod cli;
pub mod config;
pub mod document;
pub mod error;
pub mod ids;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod state_machine;
pub mod tracker;
pub mod ui;
pub mod usage;

pub use config::{QuotaflowConfig, TrackerConfig};
pub use error::{QuotaflowError, TrackingError, ValidationError};
pub use orchestrator::{Orchestrator, RequestHandle};
