//! Certified envelopes awaiting acknowledgement.
//!
//! Entries stay in send order. Acknowledgements usually arrive in that order
//! too, so the head is checked first; otherwise the queue is scanned and the
//! matching entry removed without disturbing the others.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::protocol::envelope::Envelope;

/// A transmitted certified envelope
#[derive(Debug, Clone)]
pub struct PendingCertification {
    pub envelope: Envelope,
    /// When the latest transmission was combined into a frame
    pub sent_at: Instant,
}

impl PendingCertification {
    /// Transmissions so far
    pub fn tries(&self) -> u8 {
        self.envelope.tries
    }

    fn is_expired(&self, now: Instant, default_timeout: Duration) -> bool {
        let timeout = if self.envelope.timeout.is_zero() {
            default_timeout
        } else {
            self.envelope.timeout
        };
        now.saturating_duration_since(self.sent_at) >= timeout
    }
}

#[derive(Debug, Default)]
pub struct CertifiableQueue {
    entries: VecDeque<PendingCertification>,
}

impl CertifiableQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope, sent_at: Instant) {
        self.entries.push_back(PendingCertification { envelope, sent_at });
    }

    /// Removes and returns the entry acknowledged by `unique_id`
    pub fn acknowledge(&mut self, unique_id: u32) -> Option<Envelope> {
        if self
            .entries
            .front()
            .is_some_and(|head| head.envelope.unique_id == unique_id)
        {
            return self.entries.pop_front().map(|pending| pending.envelope);
        }

        let position = self
            .entries
            .iter()
            .position(|pending| pending.envelope.unique_id == unique_id)?;
        self.entries.remove(position).map(|pending| pending.envelope)
    }

    /// Removes every entry whose timeout elapsed, in send order.
    ///
    /// Entries without their own timeout use `default_timeout`.
    pub fn take_expired(&mut self, now: Instant, default_timeout: Duration) -> Vec<PendingCertification> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for pending in self.entries.drain(..) {
            if pending.is_expired(now, default_timeout) {
                expired.push(pending);
            } else {
                kept.push_back(pending);
            }
        }
        self.entries = kept;
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingCertification> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingCertification> + '_ {
        self.entries.drain(..)
    }
}
