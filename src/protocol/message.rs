//! # Messages
//!
//! Application messages and the system messages of the transport itself.
//!
//! A message type implements [`Wire`] (usually through `wire_fields!`) and
//! [`MessageType`], which names it and declares its [`Capabilities`]. The
//! object-safe [`Message`] trait is implemented automatically so messages can
//! travel as `Box<dyn Message>`.
//!
//! Capabilities are plain flags checked by value: they decide which envelope
//! fields are written and which queue a message enters.

use std::any::Any;
use std::fmt;

use bitflags::bitflags;

use crate::core::codec::Wire;
use crate::core::wire::WireWriter;
use crate::error::Result;
use crate::wire_fields;

bitflags! {
    /// Behaviour a message type opts into
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u16 {
        /// Carries a process-unique id
        const UNIQUE = 1;
        /// Acknowledged by the receiver and retried until acknowledged (implies a unique id)
        const CERTIFIED = 1 << 1;
        /// Carries an explicit group id
        const GROUPED = 1 << 2;
        /// Released in per-group sequence order
        const ORDERED = 1 << 3;
        /// Carries sender and destination routing ids
        const ROUTED = 1 << 4;
        /// Carries the creation timestamp
        const TIMESTAMPED = 1 << 5;
        /// Enters the priority tiers
        const PRIORITIZED = 1 << 6;
        /// Newer instances supersede unsent older ones in the same slot
        const REALTIME = 1 << 7;
    }
}

impl Capabilities {
    /// Whether a unique id is written on the wire
    pub fn has_unique_id(self) -> bool {
        self.intersects(Capabilities::UNIQUE | Capabilities::CERTIFIED)
    }
}

/// Priority tiers, drained highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Lowest = 1,
    Low = 2,
    #[default]
    Normal = 3,
    High = 4,
    Highest = 5,
}

impl Priority {
    /// Number of tiers
    pub const TIERS: usize = 5;

    /// Tier index, `0` for the highest priority
    pub fn tier(self) -> usize {
        Priority::TIERS - self as usize
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Priority::Lowest),
            2 => Some(Priority::Low),
            3 => Some(Priority::Normal),
            4 => Some(Priority::High),
            5 => Some(Priority::Highest),
            _ => None,
        }
    }
}

/// Statically described message type
///
/// `Default` is required because decoding starts from a default value.
pub trait MessageType: Wire + Default + Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Fully qualified name exchanged during negotiation
    const NAME: &'static str;

    const CAPABILITIES: Capabilities = Capabilities::empty();

    /// Tier used when the type is [`Capabilities::PRIORITIZED`]
    fn send_priority(&self) -> Priority {
        Priority::default()
    }

    /// Slot superseded by newer instances when the type is [`Capabilities::REALTIME`]
    fn slot(&self) -> u64 {
        0
    }
}

/// Object-safe view of any message
pub trait Message: Any + Send + Sync + fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn priority(&self) -> Priority;

    fn realtime_slot(&self) -> u64;

    fn encode_body(&self, w: &mut WireWriter<'_>) -> Result<()>;

    fn clone_message(&self) -> Box<dyn Message>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    fn eq_message(&self, other: &dyn Message) -> bool;
}

impl<T: MessageType> Message for T {
    fn type_name(&self) -> &'static str {
        T::NAME
    }

    fn capabilities(&self) -> Capabilities {
        T::CAPABILITIES
    }

    fn priority(&self) -> Priority {
        self.send_priority()
    }

    fn realtime_slot(&self) -> u64 {
        self.slot()
    }

    fn encode_body(&self, w: &mut WireWriter<'_>) -> Result<()> {
        self.encode(w)
    }

    fn clone_message(&self) -> Box<dyn Message> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn eq_message(&self, other: &dyn Message) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }
}

impl dyn Message {
    pub fn is<T: MessageType>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: MessageType>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Takes the concrete message out of the box
    pub fn downcast<T: MessageType>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }
}

impl PartialEq for dyn Message {
    fn eq(&self, other: &Self) -> bool {
        self.eq_message(other)
    }
}

impl Clone for Box<dyn Message> {
    fn clone(&self) -> Self {
        self.clone_message()
    }
}

/// Vocabulary announcement exchanged during negotiation
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RegistrationMessage {
    /// Session id of the sending connection
    pub session_id: u32,
    pub ids: Vec<i16>,
    pub names: Vec<String>,
}
wire_fields!(RegistrationMessage { session_id, ids, names });

impl MessageType for RegistrationMessage {
    const NAME: &'static str = "msgwire.Registration";
}

/// Graceful close notice
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DisconnectMessage;
wire_fields!(DisconnectMessage {});

impl MessageType for DisconnectMessage {
    const NAME: &'static str = "msgwire.Disconnect";
}

/// No-op sent when the outbound side has been idle
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KeepAliveMessage;
wire_fields!(KeepAliveMessage {});

impl MessageType for KeepAliveMessage {
    const NAME: &'static str = "msgwire.KeepAlive";
}

/// Acknowledges a certified message by its unique id
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AckMessage {
    pub unique_id: u32,
}
wire_fields!(AckMessage { unique_id });

impl MessageType for AckMessage {
    const NAME: &'static str = "msgwire.Ack";
    const CAPABILITIES: Capabilities = Capabilities::PRIORITIZED;

    fn send_priority(&self) -> Priority {
        Priority::Highest
    }
}

/// Server-initiated close carrying a reason for the user
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KickMessage {
    pub reason: String,
}
wire_fields!(KickMessage { reason });

impl MessageType for KickMessage {
    const NAME: &'static str = "msgwire.Kick";
}

/// Clock sample request; answered with [`TimeSyncResponse`]
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TimeSyncRequest {
    /// Sender's wall clock in epoch milliseconds
    pub client_time: i64,
}
wire_fields!(TimeSyncRequest { client_time });

impl MessageType for TimeSyncRequest {
    const NAME: &'static str = "msgwire.TimeSyncRequest";
    const CAPABILITIES: Capabilities = Capabilities::PRIORITIZED;

    fn send_priority(&self) -> Priority {
        Priority::Highest
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TimeSyncResponse {
    /// Echo of the request's `client_time`
    pub client_time: i64,
    /// Responder's wall clock in epoch milliseconds
    pub server_time: i64,
}
wire_fields!(TimeSyncResponse { client_time, server_time });

impl MessageType for TimeSyncResponse {
    const NAME: &'static str = "msgwire.TimeSyncResponse";
    const CAPABILITIES: Capabilities = Capabilities::PRIORITIZED;

    fn send_priority(&self) -> Priority {
        Priority::Highest
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn test_priority_tiers() {
        assert_eq!(Priority::Highest.tier(), 0);
        assert_eq!(Priority::Lowest.tier(), 4);
        assert_eq!(Priority::from_level(4), Some(Priority::High));
        assert_eq!(Priority::from_level(0), None);
    }

    #[test]
    fn test_dyn_equality_and_downcast() {
        let a: Box<dyn Message> = Box::new(AckMessage { unique_id: 4 });
        let b = a.clone();
        assert_eq!(a, b);
        assert!(!a.eq_message(&KickMessage::default()));
        assert!(a.is::<AckMessage>());

        let ack = a.downcast::<AckMessage>().unwrap();
        assert_eq!(ack.unique_id, 4);

        let kick: Box<dyn Message> = Box::new(KickMessage::default());
        assert!(kick.downcast::<AckMessage>().is_none());
    }

    #[test]
    fn test_unique_id_capability() {
        assert!(Capabilities::CERTIFIED.has_unique_id());
        assert!(Capabilities::UNIQUE.has_unique_id());
        assert!(!Capabilities::ORDERED.has_unique_id());
    }
}
