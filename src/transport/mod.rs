//! # Transport Layer
//!
//! Connections, framing and the reactor that drives them.
//!
//! ## Components
//! - **Connection**: per-peer state machine and queues
//! - **Framer**: packs outgoing queues into length-prefixed frames and splits received bytes
//! - **Engine**: negotiation, system messages, timers and certification retries
//! - **Channels**: stream (TCP) and datagram (UDP) socket handling
//! - **Listener**: connection and message callbacks
//! - **Reactor**: the event loop thread and the handles used to talk to it

pub mod channel;
pub mod connection;
pub mod datagram;
pub mod engine;
pub mod framer;
pub mod listener;
pub mod reactor;
pub mod stream;

pub use connection::{CloseReason, ConnectionInfo, FailureReason, Status};
pub use listener::{ConnectionListener, MessageListener};
pub use reactor::{ConnectionHandle, Reactor, ReactorBuilder};
