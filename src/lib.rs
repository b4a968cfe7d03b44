//! Offline-resilient product cache, delta sync and durable sale queue for
//! point-of-sale terminals.
//!
//! The engine serves reads cache-first from an embedded SQLite store,
//! reconciles against a remote hosted store with changed-since delta
//! queries, and records sales durably the instant they occur, draining
//! them to the remote with retry and backoff once connectivity returns.

pub mod config;
pub mod engine;
pub mod identity;
pub mod kv;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;
pub mod types;

pub use config::Config;
pub use engine::PosEngine;
pub use types::{CacheMetrics, CachedProduct, QueuedSale, SaleDraft, SyncOutcome};
