//! # Protocol Layer
//!
//! Message types, envelopes, vocabulary negotiation and dispatch.
//!
//! ## Components
//! - **Message**: the `MessageType` contract, capabilities, priorities and system messages
//! - **Envelope**: transport metadata and its capability-selected wire header
//! - **Negotiation**: registration exchange and connection filtering
//! - **Dispatcher**: routes received messages to typed handlers

pub mod dispatcher;
pub mod envelope;
pub mod message;
pub mod negotiation;

pub use dispatcher::Dispatcher;
pub use envelope::Envelope;
pub use negotiation::{ConnectionFilter, NegotiationStrategy, TypeTableNegotiation};
