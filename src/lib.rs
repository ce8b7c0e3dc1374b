//! Pricestream Backend Library
//!
//! Simulated price generation, a retention-bounded time-series cache, durable
//! catch-up sync into SQLite, and history/live stitching for readers.
//! Exposed for the binaries and the integration tests.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod simulator;
pub mod stitcher;
pub mod store;
pub mod sync;

pub use error::PipelineError;
