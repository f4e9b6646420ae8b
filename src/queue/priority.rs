use std::collections::VecDeque;

use crate::protocol::envelope::Envelope;
use crate::protocol::message::Priority;

/// Five FIFO tiers, always drained highest first
#[derive(Debug, Default)]
pub struct PriorityQueue {
    tiers: [VecDeque<Envelope>; Priority::TIERS],
    len: usize,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, envelope: Envelope) {
        let tier = envelope.payload.priority().tier();
        self.tiers[tier].push_back(envelope);
        self.len += 1;
    }

    pub fn poll(&mut self) -> Option<Envelope> {
        let envelope = self.tiers.iter_mut().find_map(VecDeque::pop_front)?;
        self.len -= 1;
        Some(envelope)
    }

    pub fn peek(&self) -> Option<&Envelope> {
        self.tiers.iter().find_map(VecDeque::front)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn drain(&mut self) -> Vec<Envelope> {
        self.len = 0;
        self.tiers.iter_mut().flat_map(|tier| tier.drain(..)).collect()
    }
}
