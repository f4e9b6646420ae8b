//! # Utility Modules
//!
//! Supporting utilities for buffering, duplicate suppression, logging,
//! metrics and timing.
//!
//! ## Components
//! - **Buffer Pool**: fixed-size frame buffers checked out by the framer
//! - **Dedup**: TTL-bounded cache of received certified message ids
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe transport counters
//! - **Time**: Epoch timestamps and clock offset estimation

pub mod buffer_pool;
pub mod dedup;
pub mod logging;
pub mod metrics;
pub mod time;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use dedup::DedupCache;
