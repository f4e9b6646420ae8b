//! Per-group sequencing.
//!
//! Senders stamp ordered envelopes with consecutive sequence numbers per group
//! ([`Sequencer`]); receivers release each group strictly in that order
//! ([`OrderedQueue`]). A gap blocks its own group only.
//!
//! Sequence numbers wrap; "before" is decided by wrapping distance.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{debug, trace};

use crate::protocol::envelope::Envelope;
use crate::protocol::message::Capabilities;

/// Ordering domain of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// Explicit group id of a grouped message
    Group(u32),
    /// Message type, for messages without a group id
    Kind(&'static str),
}

impl GroupKey {
    pub fn of(envelope: &Envelope) -> Self {
        if envelope.capabilities().contains(Capabilities::GROUPED) {
            GroupKey::Group(envelope.group_id)
        } else {
            GroupKey::Kind(envelope.payload.type_name())
        }
    }
}

/// `a` precedes `b` in wrapping sequence space
fn precedes(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Sending-side sequence assignment
#[derive(Debug, Default)]
pub struct Sequencer {
    next: HashMap<GroupKey, u32>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps `envelope` with the next sequence number of its group
    pub fn assign(&mut self, envelope: &mut Envelope) {
        let next = self.next.entry(GroupKey::of(envelope)).or_insert(0);
        envelope.sequence = *next;
        *next = next.wrapping_add(1);
    }
}

/// Groups tracked before idle ones are forgotten
pub const DEFAULT_GROUP_LIMIT: usize = 4096;

/// Forgotten groups remembered per tracked group
const FORGOTTEN_FACTOR: usize = 16;

/// First sequence expected from a group the queue does not track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// New groups start at 0; only recently forgotten ones resume where they are.
    /// For received traffic, which may arrive out of order.
    Zero,
    /// Every untracked group starts at the first sequence it presents.
    /// For traffic stamped by our own [`Sequencer`], which arrives in order.
    FirstSeen,
}

#[derive(Debug, Default)]
struct GroupState {
    next_expected: u32,
    pending: BTreeMap<u32, Envelope>,
    /// Marks the latest entry of this group in the idle list
    idle_mark: u64,
}

/// Releases each group's envelopes in sequence order.
///
/// Groups with nothing pending are idle. Once more than the group limit are
/// tracked, the longest idle groups are forgotten; a forgotten group that comes
/// back restarts at the first sequence number it presents. With
/// [`GroupStart::Zero`] only the most recent `16 * limit` forgotten groups are
/// remembered as such; older ones are treated as new again.
#[derive(Debug)]
pub struct OrderedQueue {
    start: GroupStart,
    groups: HashMap<GroupKey, GroupState>,
    /// Groups whose next expected envelope is present, in release order
    ready: VecDeque<GroupKey>,
    len: usize,
    group_limit: usize,
    idle: VecDeque<(GroupKey, u64)>,
    next_mark: u64,
    forgotten: HashSet<GroupKey>,
    forgotten_order: VecDeque<GroupKey>,
}

impl Default for OrderedQueue {
    fn default() -> Self {
        Self::with_group_limit(GroupStart::Zero, DEFAULT_GROUP_LIMIT)
    }
}

impl OrderedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for envelopes stamped locally, see [`GroupStart::FirstSeen`]
    pub fn sending() -> Self {
        Self::with_group_limit(GroupStart::FirstSeen, DEFAULT_GROUP_LIMIT)
    }

    pub fn with_group_limit(start: GroupStart, group_limit: usize) -> Self {
        Self {
            start,
            groups: HashMap::new(),
            ready: VecDeque::new(),
            len: 0,
            group_limit: group_limit.max(1),
            idle: VecDeque::new(),
            next_mark: 0,
            forgotten: HashSet::new(),
            forgotten_order: VecDeque::new(),
        }
    }

    /// Whether [`offer`](Self::offer) would keep `envelope`
    pub fn accepts(&self, envelope: &Envelope) -> bool {
        match self.groups.get(&GroupKey::of(envelope)) {
            Some(group) => {
                !precedes(envelope.sequence, group.next_expected)
                    && !group.pending.contains_key(&envelope.sequence)
            }
            None => true,
        }
    }

    /// Queues `envelope`; returns `false` when it was dropped as stale or duplicate
    pub fn offer(&mut self, envelope: Envelope) -> bool {
        let key = GroupKey::of(&envelope);
        let sequence = envelope.sequence;
        if !self.groups.contains_key(&key) {
            self.make_room();
            let resumed = self.forgotten.remove(&key);
            let next_expected = if resumed || self.start == GroupStart::FirstSeen {
                sequence
            } else {
                0
            };
            self.groups.insert(
                key,
                GroupState {
                    next_expected,
                    ..GroupState::default()
                },
            );
        }
        let Some(group) = self.groups.get_mut(&key) else {
            return false;
        };

        if precedes(sequence, group.next_expected) || group.pending.contains_key(&sequence) {
            debug!(?key, sequence, next_expected = group.next_expected, "Dropping stale ordered message");
            return false;
        }

        group.pending.insert(sequence, envelope);
        self.len += 1;
        if sequence == group.next_expected && !self.ready.contains(&key) {
            self.ready.push_back(key);
        }
        true
    }

    /// Groups currently tracked, idle ones included
    pub fn tracked_groups(&self) -> usize {
        self.groups.len()
    }

    fn make_room(&mut self) {
        while self.groups.len() >= self.group_limit {
            let Some((key, mark)) = self.idle.pop_front() else {
                return;
            };
            let still_idle = self
                .groups
                .get(&key)
                .is_some_and(|group| group.pending.is_empty() && group.idle_mark == mark);
            if still_idle {
                self.groups.remove(&key);
                trace!(?key, "Forgetting idle ordered group");
                if self.start == GroupStart::FirstSeen {
                    continue;
                }
                self.forgotten.insert(key);
                self.forgotten_order.push_back(key);
                if self.forgotten_order.len() > self.group_limit.saturating_mul(FORGOTTEN_FACTOR) {
                    if let Some(oldest) = self.forgotten_order.pop_front() {
                        self.forgotten.remove(&oldest);
                    }
                }
            }
        }
    }

    fn mark_idle(&mut self, key: GroupKey) {
        let mark = self.next_mark;
        self.next_mark += 1;
        if let Some(group) = self.groups.get_mut(&key) {
            group.idle_mark = mark;
        }
        self.idle.push_back((key, mark));

        // Drop entries superseded by a later mark
        if self.idle.len() > self.group_limit.saturating_mul(2) {
            let groups = &self.groups;
            self.idle.retain(|(key, mark)| {
                groups
                    .get(key)
                    .is_some_and(|group| group.pending.is_empty() && group.idle_mark == *mark)
            });
        }
    }

    pub fn poll(&mut self) -> Option<Envelope> {
        let key = self.ready.pop_front()?;
        let group = self.groups.get_mut(&key)?;
        let envelope = group.pending.remove(&group.next_expected)?;
        group.next_expected = group.next_expected.wrapping_add(1);
        self.len -= 1;

        if group.pending.contains_key(&group.next_expected) {
            self.ready.push_back(key);
        } else if group.pending.is_empty() {
            self.mark_idle(key);
        }
        Some(envelope)
    }

    pub fn peek(&self) -> Option<&Envelope> {
        let key = self.ready.front()?;
        let group = self.groups.get(key)?;
        group.pending.get(&group.next_expected)
    }

    /// Queued envelopes, including those blocked behind a gap
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Envelopes that can be polled right now
    pub fn releasable(&self) -> usize {
        self.ready.len()
    }

    /// Removes everything, blocked envelopes included, group by group
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.ready.clear();
        self.len = 0;
        self.groups
            .values_mut()
            .flat_map(|group| std::mem::take(&mut group.pending).into_values())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::protocol::message::MessageType;
    use crate::wire_fields;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Step {
        n: u32,
    }
    wire_fields!(Step { n });
    impl MessageType for Step {
        const NAME: &'static str = "test.Step";
        const CAPABILITIES: Capabilities = Capabilities::ORDERED;
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Chapter {
        n: u32,
    }
    wire_fields!(Chapter { n });
    impl MessageType for Chapter {
        const NAME: &'static str = "test.Chapter";
        const CAPABILITIES: Capabilities = Capabilities::ORDERED.union(Capabilities::GROUPED);
    }

    fn step(sequence: u32) -> Envelope {
        let mut envelope = Envelope::of(Step { n: sequence });
        envelope.sequence = sequence;
        envelope
    }

    fn n(envelope: Envelope) -> u32 {
        envelope.payload.downcast_ref::<Step>().unwrap().n
    }

    #[test]
    fn test_out_of_order_arrival_is_released_in_order() {
        let mut queue = OrderedQueue::new();
        queue.offer(step(2));
        assert!(queue.poll().is_none(), "2 must wait for 0 and 1");

        queue.offer(step(0));
        queue.offer(step(1));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.releasable(), 1);

        assert_eq!(queue.poll().map(n), Some(0));
        assert_eq!(queue.peek().map(|e| e.sequence), Some(1));
        assert_eq!(queue.poll().map(n), Some(1));
        assert_eq!(queue.poll().map(n), Some(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stale_and_duplicate_are_dropped() {
        let mut queue = OrderedQueue::new();
        assert!(queue.offer(step(0)));
        assert!(!queue.offer(step(0)));
        queue.poll();
        assert!(!queue.offer(step(0)));
        assert!(queue.offer(step(1)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_gap_blocks_only_its_group() {
        let mut queue = OrderedQueue::new();
        let mut late = Envelope::of(Chapter { n: 1 }).with_group(7);
        late.sequence = 1;
        queue.offer(late);

        let mut other = Envelope::of(Chapter { n: 0 }).with_group(8);
        other.sequence = 0;
        queue.offer(other);

        let polled = queue.poll().unwrap();
        assert_eq!(polled.group_id, 8);
        assert!(queue.poll().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_sequencer_counts_per_group() {
        let mut sequencer = Sequencer::new();
        let mut a = Envelope::of(Chapter::default()).with_group(1);
        let mut b = Envelope::of(Chapter::default()).with_group(2);
        let mut c = Envelope::of(Chapter::default()).with_group(1);
        let mut d = Envelope::of(Step::default());
        sequencer.assign(&mut a);
        sequencer.assign(&mut b);
        sequencer.assign(&mut c);
        sequencer.assign(&mut d);
        assert_eq!((a.sequence, b.sequence, c.sequence, d.sequence), (0, 0, 1, 0));
    }

    #[test]
    fn test_wrapping_precedence() {
        assert!(precedes(u32::MAX, 0));
        assert!(!precedes(0, u32::MAX));
        assert!(precedes(4, 5));
    }

    fn chapter(group: u32, sequence: u32) -> Envelope {
        let mut envelope = Envelope::of(Chapter { n: sequence }).with_group(group);
        envelope.sequence = sequence;
        envelope
    }

    #[test]
    fn test_idle_groups_are_forgotten_past_the_limit() {
        let mut queue = OrderedQueue::with_group_limit(GroupStart::Zero, 4);
        for group in 0..100 {
            assert!(queue.offer(chapter(group, 0)));
            assert!(queue.poll().is_some());
        }
        assert!(queue.tracked_groups() <= 4);

        // A recently forgotten group resumes at whatever it presents next
        assert!(queue.offer(chapter(95, 1)));
        assert_eq!(queue.poll().map(|e| e.sequence), Some(1));
        assert!(!queue.offer(chapter(95, 0)));

        // A group never seen before still waits for sequence 0
        assert!(queue.offer(chapter(500, 1)));
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_sending_queue_resumes_any_untracked_group() {
        let mut queue = OrderedQueue::with_group_limit(GroupStart::FirstSeen, 2);
        for group in 0..10 {
            for sequence in 0..3 {
                assert!(queue.offer(chapter(group, sequence)));
                assert!(queue.poll().is_some());
            }
        }
        assert!(queue.tracked_groups() <= 2);

        // Long forgotten, yet its next stamped envelope is released at once
        assert!(queue.offer(chapter(0, 3)));
        assert_eq!(queue.poll().map(|e| (e.group_id, e.sequence)), Some((0, 3)));
    }

    #[test]
    fn test_groups_with_pending_envelopes_are_kept() {
        let mut queue = OrderedQueue::with_group_limit(GroupStart::Zero, 2);
        // Each group waits for sequence 0, so none of them is idle
        for group in 0..5 {
            assert!(queue.offer(chapter(group, 1)));
        }
        assert_eq!(queue.tracked_groups(), 5);
        assert!(queue.poll().is_none());

        assert!(queue.offer(chapter(3, 0)));
        assert_eq!(queue.poll().map(|e| (e.group_id, e.sequence)), Some((3, 0)));
        assert_eq!(queue.poll().map(|e| (e.group_id, e.sequence)), Some((3, 1)));
    }

    #[test]
    fn test_accepts_matches_offer() {
        let mut queue = OrderedQueue::new();
        assert!(queue.accepts(&step(0)));
        queue.offer(step(0));
        assert!(!queue.accepts(&step(0)));
        queue.poll();
        assert!(!queue.accepts(&step(0)));
        assert!(queue.accepts(&step(1)));
    }
}
