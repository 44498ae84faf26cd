//! # genq
//!
//! Postgres-backed task queue for AI content generation.
//!
//! Producers enqueue tasks keyed by kind and owner; a pool of workers claims
//! them under a lease and runs the registered handler; a watchdog fails
//! abandoned leases; the status resolver merges live task state with
//! persisted results for pollers.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod retry;
pub mod status;
pub mod telemetry;
