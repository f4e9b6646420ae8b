use tracing::trace;

use crate::error::{ProtocolError, Result};
use crate::protocol::envelope::Envelope;
use crate::protocol::message::Capabilities;
use crate::queue::{BasicQueue, OrderedQueue, PriorityQueue, RealtimeQueue};

/// The four disciplines behind one bounded queue.
///
/// An envelope enters exactly one sub-queue, chosen by its capabilities in
/// this precedence: realtime, ordered, prioritized, basic. Polling always
/// tries realtime, then priority, then ordered, then basic.
///
/// Retransmissions of certified envelopes already carry their sequence number,
/// so they skip the ordered sub-queue and wait in a retry lane polled right
/// after realtime.
#[derive(Debug)]
pub struct MultiQueue {
    realtime: RealtimeQueue,
    retries: BasicQueue,
    priority: PriorityQueue,
    ordered: OrderedQueue,
    basic: BasicQueue,
    capacity: usize,
}

impl MultiQueue {
    /// Queue for received envelopes
    pub fn new(capacity: usize) -> Self {
        Self::with_ordered(OrderedQueue::new(), capacity)
    }

    /// Queue for envelopes stamped by this side's [`Sequencer`](crate::queue::Sequencer)
    pub fn sending(capacity: usize) -> Self {
        Self::with_ordered(OrderedQueue::sending(), capacity)
    }

    fn with_ordered(ordered: OrderedQueue, capacity: usize) -> Self {
        Self {
            realtime: RealtimeQueue::new(),
            retries: BasicQueue::new(),
            priority: PriorityQueue::new(),
            ordered,
            basic: BasicQueue::new(),
            capacity,
        }
    }

    /// Queues `envelope` or fails with [`ProtocolError::QueueFull`].
    ///
    /// Returns the envelope that did not make it into the queue: the unsent
    /// realtime envelope `envelope` superseded, or `envelope` itself when it is
    /// a stale or duplicate ordered envelope. Replacing a queued realtime
    /// envelope never counts against the capacity.
    pub fn offer(&mut self, envelope: Envelope) -> Result<Option<Envelope>> {
        let caps = envelope.capabilities();
        let supersedes = caps.contains(Capabilities::REALTIME) && self.realtime.supersedes(&envelope);
        if !supersedes && self.len() >= self.capacity {
            return Err(ProtocolError::QueueFull(self.capacity));
        }

        if caps.contains(Capabilities::REALTIME) {
            return Ok(self.realtime.offer(envelope));
        }
        if caps.contains(Capabilities::ORDERED) {
            if !self.ordered.accepts(&envelope) {
                trace!(sequence = envelope.sequence, "Ordered message discarded");
                return Ok(Some(envelope));
            }
            self.ordered.offer(envelope);
        } else if caps.contains(Capabilities::PRIORITIZED) {
            self.priority.offer(envelope);
        } else {
            self.basic.offer(envelope);
        }
        Ok(None)
    }

    /// Queues a retransmission of an envelope that was already polled once.
    ///
    /// A realtime retry whose slot holds a newer unsent envelope loses to it and
    /// comes back as `Ok(Some(envelope))`.
    pub fn retry(&mut self, envelope: Envelope) -> Result<Option<Envelope>> {
        if envelope.capabilities().contains(Capabilities::REALTIME) {
            if self.realtime.supersedes(&envelope) {
                trace!(unique_id = envelope.unique_id, "Retry superseded by a newer realtime message");
                return Ok(Some(envelope));
            }
            if self.len() >= self.capacity {
                return Err(ProtocolError::QueueFull(self.capacity));
            }
            return Ok(self.realtime.offer(envelope));
        }

        if self.len() >= self.capacity {
            return Err(ProtocolError::QueueFull(self.capacity));
        }
        self.retries.offer(envelope);
        Ok(None)
    }

    pub fn poll(&mut self) -> Option<Envelope> {
        self.realtime
            .poll()
            .or_else(|| self.retries.poll())
            .or_else(|| self.priority.poll())
            .or_else(|| self.ordered.poll())
            .or_else(|| self.basic.poll())
    }

    /// The envelope the next [`poll`](Self::poll) returns
    pub fn peek(&self) -> Option<&Envelope> {
        self.realtime
            .peek()
            .or_else(|| self.retries.peek())
            .or_else(|| self.priority.peek())
            .or_else(|| self.ordered.peek())
            .or_else(|| self.basic.peek())
    }

    pub fn len(&self) -> usize {
        self.realtime.len()
            + self.retries.len()
            + self.priority.len()
            + self.ordered.len()
            + self.basic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes every envelope, including ordered ones blocked behind a gap
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut drained = self.realtime.drain();
        drained.extend(self.retries.drain());
        drained.extend(self.priority.drain());
        drained.extend(self.ordered.drain());
        drained.extend(self.basic.drain());
        drained
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::protocol::message::{MessageType, Priority};
    use crate::wire_fields;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Plain {
        id: u8,
    }
    wire_fields!(Plain { id });
    impl MessageType for Plain {
        const NAME: &'static str = "test.Plain";
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Urgent {
        id: u8,
        level: u8,
    }
    wire_fields!(Urgent { id, level });
    impl MessageType for Urgent {
        const NAME: &'static str = "test.Urgent";
        const CAPABILITIES: Capabilities = Capabilities::PRIORITIZED;

        fn send_priority(&self) -> Priority {
            Priority::from_level(self.level).unwrap_or_default()
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Tick {
        id: u8,
    }
    wire_fields!(Tick { id });
    impl MessageType for Tick {
        const NAME: &'static str = "test.Tick";
        const CAPABILITIES: Capabilities = Capabilities::REALTIME;
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Step {
        id: u8,
    }
    wire_fields!(Step { id });
    impl MessageType for Step {
        const NAME: &'static str = "test.Step";
        const CAPABILITIES: Capabilities = Capabilities::ORDERED;
    }

    fn step(id: u8, sequence: u32) -> Envelope {
        let mut envelope = Envelope::of(Step { id });
        envelope.sequence = sequence;
        envelope
    }

    fn id(envelope: Envelope) -> u8 {
        let payload = &envelope.payload;
        payload
            .downcast_ref::<Plain>()
            .map(|m| m.id)
            .or_else(|| payload.downcast_ref::<Urgent>().map(|m| m.id))
            .or_else(|| payload.downcast_ref::<Tick>().map(|m| m.id))
            .or_else(|| payload.downcast_ref::<Step>().map(|m| m.id))
            .unwrap()
    }

    #[test]
    fn test_poll_order_across_disciplines() {
        let mut queue = MultiQueue::new(16);
        queue.offer(Envelope::of(Plain { id: 4 })).unwrap();
        queue.offer(Envelope::of(Urgent { id: 3, level: 1 })).unwrap();
        queue.offer(Envelope::of(Urgent { id: 2, level: 5 })).unwrap();
        queue.offer(Envelope::of(Tick { id: 1 })).unwrap();

        assert_eq!(queue.peek().map(|e| e.payload.type_name()), Some("test.Tick"));
        let order: Vec<u8> = std::iter::from_fn(|| queue.poll()).map(id).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_capacity_bound() {
        let mut queue = MultiQueue::new(2);
        queue.offer(Envelope::of(Plain { id: 1 })).unwrap();
        queue.offer(Envelope::of(Tick { id: 2 })).unwrap();
        assert!(matches!(
            queue.offer(Envelope::of(Plain { id: 3 })),
            Err(ProtocolError::QueueFull(2))
        ));

        // Superseding the queued tick does not grow the queue
        let superseded = queue.offer(Envelope::of(Tick { id: 5 })).unwrap();
        assert_eq!(superseded.map(id), Some(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.poll().map(id), Some(5));
    }

    #[test]
    fn test_drain_empties_everything() {
        let mut queue = MultiQueue::new(8);
        queue.offer(Envelope::of(Plain { id: 1 })).unwrap();
        queue.offer(Envelope::of(Urgent { id: 2, level: 2 })).unwrap();
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stale_ordered_envelope_is_handed_back() {
        let mut queue = MultiQueue::new(8);
        assert!(queue.offer(step(1, 0)).unwrap().is_none());
        assert_eq!(queue.poll().map(id), Some(1));

        let stale = queue.offer(step(1, 0)).unwrap();
        assert_eq!(stale.map(id), Some(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_retry_skips_the_ordered_sequence() {
        let mut queue = MultiQueue::new(8);
        queue.offer(step(1, 0)).unwrap();
        queue.offer(step(2, 1)).unwrap();
        let sent = queue.poll().unwrap();
        queue.offer(Envelope::of(Plain { id: 9 })).unwrap();

        // Sequence 0 is behind the ordered queue but the retry is still sent,
        // ahead of everything except realtime
        assert!(queue.retry(sent).unwrap().is_none());
        queue.offer(Envelope::of(Tick { id: 7 })).unwrap();
        assert_eq!(queue.len(), 4);
        let order: Vec<u8> = std::iter::from_fn(|| queue.poll()).map(id).collect();
        assert_eq!(order, vec![7, 1, 2, 9]);
    }

    #[test]
    fn test_realtime_retry_loses_to_newer_update() {
        let mut queue = MultiQueue::new(8);
        queue.offer(Envelope::of(Tick { id: 1 })).unwrap();
        let sent = queue.poll().unwrap();
        queue.offer(Envelope::of(Tick { id: 2 })).unwrap();

        let lost = queue.retry(sent).unwrap();
        assert_eq!(lost.map(id), Some(1));
        assert_eq!(queue.poll().map(id), Some(2));

        // With the slot free the retry is queued as usual
        queue.offer(Envelope::of(Tick { id: 3 })).unwrap();
        let sent = queue.poll().unwrap();
        assert!(queue.retry(sent).unwrap().is_none());
        assert_eq!(queue.poll().map(id), Some(3));
    }

    #[test]
    fn test_retry_respects_capacity() {
        let mut queue = MultiQueue::new(1);
        queue.offer(Envelope::of(Plain { id: 1 })).unwrap();
        assert!(matches!(
            queue.retry(Envelope::of(Plain { id: 2 })),
            Err(ProtocolError::QueueFull(1))
        ));
    }
}
