//! # msgwire
//!
//! Reliable, application-level message transport over raw stream (TCP) and
//! datagram (UDP) sockets.
//!
//! The crate negotiates a per-connection type vocabulary, encodes application
//! messages into a compact binary form, multiplexes outgoing traffic through
//! realtime, priority, ordered and FIFO queues, frames it into length-prefixed
//! records and drives everything from a single non-blocking reactor thread.
//!
//! ## Layers
//! - [`core`]: wire primitives, the [`core::codec::Wire`] trait and the type registry
//! - [`protocol`]: messages, envelopes, negotiation and dispatch
//! - [`queue`]: the queueing disciplines and the certification queue
//! - [`transport`]: framer, connection state machine and reactor
//! - [`utils`]: buffer pool, duplicate cache, metrics, logging and time helpers
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use msgwire::config::NetworkConfig;
//! use msgwire::core::registry::TypeRegistry;
//! use msgwire::transport::reactor::Reactor;
//!
//! # fn main() -> msgwire::error::Result<()> {
//! let registry = Arc::new(TypeRegistry::new());
//! let server = Reactor::bind_stream("127.0.0.1:7000".parse().unwrap(), registry, NetworkConfig::default())?;
//! # server.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod transport;
pub mod utils;

pub use crate::core::codec::Wire;
pub use crate::core::registry::TypeRegistry;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::envelope::Envelope;
pub use crate::protocol::message::{Capabilities, Message, MessageType, Priority};
pub use crate::transport::reactor::{ConnectionHandle, Reactor};
