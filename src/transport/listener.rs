//! # Listeners
//!
//! Callbacks through which connection lifecycle and message events leave the
//! reactor. They run on the reactor thread after the I/O pass, with no
//! connection lock held, and must not block. Sending from a callback is fine.

use std::sync::{Arc, PoisonError, RwLock};

use crate::protocol::envelope::Envelope;
use crate::transport::connection::{CloseReason, FailureReason};
use crate::transport::reactor::ConnectionHandle;

/// Connection lifecycle events
pub trait ConnectionListener: Send + Sync {
    /// Transport established; negotiation starts
    fn on_connected(&self, _connection: &ConnectionHandle) {}

    /// Vocabularies exchanged; application traffic flows
    fn on_negotiated(&self, _connection: &ConnectionHandle) {}

    /// Terminal status reached
    fn on_disconnected(&self, _connection: &ConnectionHandle, _reason: CloseReason) {}

    /// The peer kicked this side
    fn on_kicked(&self, _connection: &ConnectionHandle, _reason: &str) {}
}

/// Message events
pub trait MessageListener: Send + Sync {
    /// An application message arrived
    fn on_received(&self, _connection: &ConnectionHandle, _envelope: &Envelope) {}

    /// An application message was fully written to the socket
    fn on_sent(&self, _connection: &ConnectionHandle, _envelope: &Envelope) {}

    /// A certified message was acknowledged
    fn on_certified(&self, _connection: &ConnectionHandle, _envelope: &Envelope) {}

    /// A message will never be delivered
    fn on_failed(&self, _connection: &ConnectionHandle, _envelope: &Envelope, _reason: FailureReason) {}
}

/// Registered listeners of one reactor
#[derive(Default)]
pub struct Listeners {
    connection: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    message: RwLock<Vec<Arc<dyn MessageListener>>>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("connection", &self.connection_listeners().len())
            .field("message", &self.message_listeners().len())
            .finish()
    }
}

impl Listeners {
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.message
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Snapshot, so callbacks may register further listeners
    pub fn connection_listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn message_listeners(&self) -> Vec<Arc<dyn MessageListener>> {
        self.message
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
