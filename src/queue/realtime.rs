use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::protocol::envelope::Envelope;

/// Logical slot of a realtime message: its type and the slot it declares
pub type SlotKey = (&'static str, u64);

fn slot_of(envelope: &Envelope) -> SlotKey {
    (envelope.payload.type_name(), envelope.payload.realtime_slot())
}

/// Superseding queue: at most one unsent envelope per slot.
///
/// A newer envelope for an occupied slot replaces the queued one in place and
/// keeps its position, so a frequently updated slot is not starved.
#[derive(Debug, Default)]
pub struct RealtimeQueue {
    order: VecDeque<SlotKey>,
    slots: HashMap<SlotKey, Envelope>,
}

impl RealtimeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether offering `envelope` would replace a queued one
    pub fn supersedes(&self, envelope: &Envelope) -> bool {
        self.slots.contains_key(&slot_of(envelope))
    }

    /// Queues `envelope`, returning the envelope it superseded
    pub fn offer(&mut self, envelope: Envelope) -> Option<Envelope> {
        let key = slot_of(&envelope);
        let previous = self.slots.insert(key, envelope);
        if previous.is_none() {
            self.order.push_back(key);
        } else {
            trace!(type_name = key.0, slot = key.1, "Superseded unsent realtime message");
        }
        previous
    }

    pub fn poll(&mut self) -> Option<Envelope> {
        let key = self.order.pop_front()?;
        self.slots.remove(&key)
    }

    pub fn peek(&self) -> Option<&Envelope> {
        self.order.front().and_then(|key| self.slots.get(key))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut drained = Vec::with_capacity(self.order.len());
        while let Some(envelope) = self.poll() {
            drained.push(envelope);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::protocol::message::{Capabilities, MessageType};
    use crate::wire_fields;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Position {
        entity: u64,
        x: i32,
    }
    wire_fields!(Position { entity, x });
    impl MessageType for Position {
        const NAME: &'static str = "test.Position";
        const CAPABILITIES: Capabilities = Capabilities::REALTIME;

        fn slot(&self) -> u64 {
            self.entity
        }
    }

    fn x(envelope: Envelope) -> i32 {
        envelope.payload.downcast_ref::<Position>().unwrap().x
    }

    #[test]
    fn test_newer_update_replaces_in_place() {
        let mut queue = RealtimeQueue::new();
        assert!(queue.offer(Envelope::of(Position { entity: 1, x: 10 })).is_none());
        assert!(queue.offer(Envelope::of(Position { entity: 2, x: 20 })).is_none());

        let replaced = queue.offer(Envelope::of(Position { entity: 1, x: 11 }));
        assert_eq!(replaced.map(x), Some(10));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.poll().map(x), Some(11));
        assert_eq!(queue.poll().map(x), Some(20));
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_polled_slot_accepts_new_instance() {
        let mut queue = RealtimeQueue::new();
        queue.offer(Envelope::of(Position { entity: 1, x: 1 }));
        assert_eq!(queue.poll().map(x), Some(1));

        let next = Envelope::of(Position { entity: 1, x: 2 });
        assert!(!queue.supersedes(&next));
        assert!(queue.offer(next).is_none());
        assert_eq!(queue.len(), 1);
    }
}
