//! # Message Envelope
//!
//! Routing and reliability metadata attached to a message payload.
//!
//! Only the fields implied by the payload's [`Capabilities`] are written, in
//! this order, between the class id and the body:
//!
//! ```text
//! [UniqueId(u32)]        UNIQUE or CERTIFIED
//! [GroupId(u32)]         GROUPED
//! [Sequence(u32)]        ORDERED
//! [Sender(u32)][Dest(u32)] ROUTED
//! [Timestamp(i64)]       TIMESTAMPED
//! [Tries(u8)]            CERTIFIED
//! ```
//!
//! Everything else (`max_tries`, `timeout`, owning connection) is transient and
//! never leaves the process.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::core::codec::{read_class, write_class};
use crate::core::wire::{WireReader, WireWriter};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{
    AckMessage, Capabilities, DisconnectMessage, KeepAliveMessage, KickMessage, Message,
    MessageType, RegistrationMessage, TimeSyncRequest, TimeSyncResponse,
};

/// Identifier of a connection within one reactor
pub type ConnectionId = u32;

/// A payload plus its transport metadata
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Box<dyn Message>,
    pub unique_id: u32,
    pub group_id: u32,
    pub sequence: u32,
    pub sender_id: u32,
    pub destination_id: u32,
    /// Creation time in epoch milliseconds
    pub timestamp: i64,
    /// Number of transmissions so far
    pub tries: u8,
    pub max_tries: u8,
    /// Certification timeout per try
    pub timeout: Duration,
    pub connection: Option<ConnectionId>,
}

impl Envelope {
    pub fn new(payload: Box<dyn Message>) -> Self {
        Self {
            payload,
            unique_id: 0,
            group_id: 0,
            sequence: 0,
            sender_id: 0,
            destination_id: 0,
            timestamp: 0,
            tries: 0,
            max_tries: 0,
            timeout: Duration::ZERO,
            connection: None,
        }
    }

    pub fn of<T: MessageType>(payload: T) -> Self {
        Self::new(Box::new(payload))
    }

    pub fn with_group(mut self, group_id: u32) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_route(mut self, sender_id: u32, destination_id: u32) -> Self {
        self.sender_id = sender_id;
        self.destination_id = destination_id;
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        self.payload.capabilities()
    }

    pub fn is_certified(&self) -> bool {
        self.capabilities().contains(Capabilities::CERTIFIED)
    }

    /// Messages allowed on the wire before negotiation completes
    pub fn is_handshake(&self) -> bool {
        self.payload.is::<RegistrationMessage>()
            || self.payload.is::<DisconnectMessage>()
            || self.payload.is::<KickMessage>()
    }

    /// Transport-internal messages, never reported to message listeners
    pub fn is_system(&self) -> bool {
        self.is_handshake()
            || self.payload.is::<KeepAliveMessage>()
            || self.payload.is::<AckMessage>()
            || self.payload.is::<TimeSyncRequest>()
            || self.payload.is::<TimeSyncResponse>()
    }
}

/// Writes class id, capability-selected header fields and body
pub fn write_envelope(w: &mut WireWriter<'_>, envelope: &Envelope) -> Result<()> {
    let caps = envelope.capabilities();
    write_class(w, &*envelope.payload)?;

    if caps.has_unique_id() {
        w.put_u32(envelope.unique_id);
    }
    if caps.contains(Capabilities::GROUPED) {
        w.put_u32(envelope.group_id);
    }
    if caps.contains(Capabilities::ORDERED) {
        w.put_u32(envelope.sequence);
    }
    if caps.contains(Capabilities::ROUTED) {
        w.put_u32(envelope.sender_id);
        w.put_u32(envelope.destination_id);
    }
    if caps.contains(Capabilities::TIMESTAMPED) {
        w.put_i64(envelope.timestamp);
    }
    if caps.contains(Capabilities::CERTIFIED) {
        w.put_u8(envelope.tries);
    }

    envelope.payload.encode_body(w)
}

/// Reads what [`write_envelope`] wrote
pub fn read_envelope(r: &mut WireReader<'_>) -> Result<Envelope> {
    let entry = read_class(r)?
        .ok_or_else(|| ProtocolError::Malformed("null message envelope".to_string()))?;
    let caps = entry.capabilities;

    let unique_id = if caps.has_unique_id() { r.get_u32()? } else { 0 };
    let group_id = if caps.contains(Capabilities::GROUPED) {
        r.get_u32()?
    } else {
        0
    };
    let sequence = if caps.contains(Capabilities::ORDERED) {
        r.get_u32()?
    } else {
        0
    };
    let (sender_id, destination_id) = if caps.contains(Capabilities::ROUTED) {
        (r.get_u32()?, r.get_u32()?)
    } else {
        (0, 0)
    };
    let timestamp = if caps.contains(Capabilities::TIMESTAMPED) {
        r.get_i64()?
    } else {
        0
    };
    let tries = if caps.contains(Capabilities::CERTIFIED) {
        r.get_u8()?
    } else {
        0
    };

    let payload = entry.decode(r)?;
    Ok(Envelope {
        unique_id,
        group_id,
        sequence,
        sender_id,
        destination_id,
        timestamp,
        tries,
        ..Envelope::new(payload)
    })
}

/// Process-local unique id source; wraps back to 1 before reaching the sign bit
#[derive(Debug)]
pub struct UniqueIds {
    next: AtomicU32,
}

impl Default for UniqueIds {
    fn default() -> Self {
        Self::new()
    }
}

impl UniqueIds {
    pub const MAX: u32 = i32::MAX as u32;

    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first.clamp(1, Self::MAX)),
        }
    }

    pub fn next_id(&self) -> u32 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current >= Self::MAX { 1 } else { current + 1 };
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}
