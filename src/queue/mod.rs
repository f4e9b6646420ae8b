//! # Queueing Disciplines
//!
//! Per-connection queues for outgoing and incoming envelopes.
//!
//! ## Components
//! - **Basic**: plain FIFO
//! - **Priority**: five tiers, drained highest first, FIFO within a tier
//! - **Realtime**: newer instances supersede unsent older ones of the same slot
//! - **Ordered**: per-group sequence release with head-of-line blocking inside a group
//! - **Multi**: the four above composed and polled realtime → priority → ordered → basic
//! - **Certify**: certified envelopes awaiting acknowledgement
//!
//! Queues are plain single-owner structures; the connection that owns them
//! provides the locking.

pub mod basic;
pub mod certify;
pub mod multi;
pub mod ordered;
pub mod priority;
pub mod realtime;

pub use basic::BasicQueue;
pub use certify::{CertifiableQueue, PendingCertification};
pub use multi::MultiQueue;
pub use ordered::{GroupKey, GroupStart, OrderedQueue, Sequencer};
pub use priority::PriorityQueue;
pub use realtime::RealtimeQueue;
