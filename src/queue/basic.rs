use std::collections::VecDeque;

use crate::protocol::envelope::Envelope;

/// First in, first out
#[derive(Debug, Default)]
pub struct BasicQueue {
    entries: VecDeque<Envelope>,
}

impl BasicQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, envelope: Envelope) {
        self.entries.push_back(envelope);
    }

    pub fn poll(&mut self) -> Option<Envelope> {
        self.entries.pop_front()
    }

    pub fn peek(&self) -> Option<&Envelope> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Envelope> + '_ {
        self.entries.drain(..)
    }
}
