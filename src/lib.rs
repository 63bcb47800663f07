//! # Syncline
//!
//! Multi-provider activity sync and enrichment service: durable per
//! integration sync runs, idempotent event ingestion, an at-least-once
//! enrichment queue producing summaries and embeddings, and a retrieval
//! layer that feeds a bounded status-update agent.

pub mod ai;
pub mod config;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod handlers;
pub mod models;
pub mod providers;
pub mod repositories;
pub mod retrieval;
pub mod scheduler;
pub mod server;
pub mod sync;
pub mod telemetry;
pub use migration;
