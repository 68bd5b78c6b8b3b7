//! # Treeherder Pulse Ingestion
//!
//! Consumes CI job events from the Pulse message bus, validates and
//! normalizes them, reconciles them against stored job state and commits the
//! results in batches, acknowledging each message only after its batch is
//! durably stored.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod normalization;
pub mod pipeline;
pub mod pulse;
pub mod reconciler;
pub mod refdata;
pub mod repositories;
pub mod store;
pub mod telemetry;
pub mod validation;
pub use migration;
