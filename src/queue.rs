//! Event and reaction queues.
//!
//! [`EventQueue`] orders pending events by `(tag, trigger)`. Scheduling the
//! same trigger twice at one tag keeps only the last value, so the order in
//! which events were inserted never shows through.
//!
//! [`ReactionQueue`] holds the reactions triggered at the current tag,
//! ordered by `(level, reaction id)`.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::event::{Event, Trigger};
use crate::port::Value;
use crate::tag::Tag;
use crate::types::ReactionId;

/// Pending events keyed by tag, then trigger.
#[derive(Clone, Debug, Default)]
pub struct EventQueue {
    events: BTreeMap<Tag, BTreeMap<Trigger, Option<Value>>>,
    len: usize,
    peak: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `event`. Returns `true` if it replaced an event with the same
    /// tag and trigger.
    pub fn schedule(&mut self, event: Event) -> bool {
        let slot = self.events.entry(event.tag).or_default();
        let replaced = slot.insert(event.trigger, event.payload).is_some();
        if !replaced {
            self.len += 1;
            self.peak = self.peak.max(self.len);
        }
        replaced
    }

    /// Earliest pending tag.
    pub fn next_tag(&self) -> Option<Tag> {
        self.events.keys().next().copied()
    }

    /// Removes and returns every event at `tag`, in trigger order.
    pub fn pop_tag(&mut self, tag: Tag) -> Vec<Event> {
        let Some(slot) = self.events.remove(&tag) else {
            return Vec::new();
        };
        self.len -= slot.len();
        slot.into_iter()
            .map(|(trigger, payload)| Event::new(tag, trigger, payload))
            .collect()
    }

    /// Removes one pending event.
    pub fn remove(&mut self, tag: Tag, trigger: &Trigger) -> bool {
        let Some(slot) = self.events.get_mut(&tag) else {
            return false;
        };
        let removed = slot.remove(trigger).is_some();
        if removed {
            self.len -= 1;
        }
        if slot.is_empty() {
            self.events.remove(&tag);
        }
        removed
    }

    /// Drops every event later than `tag`; returns how many were dropped.
    pub fn discard_after(&mut self, tag: Tag) -> usize {
        if tag.is_forever() {
            return 0;
        }
        let later = self.events.split_off(&tag.next_microstep());
        let dropped: usize = later.values().map(BTreeMap::len).sum();
        self.len -= dropped;
        dropped
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest number of events held at once.
    pub fn peak(&self) -> usize {
        self.peak
    }
}

/// Reactions triggered at the current tag.
#[derive(Clone, Debug, Default)]
pub struct ReactionQueue {
    pending: BTreeSet<(usize, ReactionId)>,
    /// Reactions queued or run at this tag; each runs at most once per tag.
    seen: HashSet<ReactionId>,
}

impl ReactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `reaction` at `level` unless it was already queued this tag.
    pub fn push(&mut self, level: usize, reaction: ReactionId) -> bool {
        if !self.seen.insert(reaction) {
            return false;
        }
        self.pending.insert((level, reaction));
        true
    }

    pub fn has_seen(&self, reaction: ReactionId) -> bool {
        self.seen.contains(&reaction)
    }

    /// Whether `reaction` already ran at this tag.
    pub fn has_run(&self, level: usize, reaction: ReactionId) -> bool {
        self.seen.contains(&reaction) && !self.pending.contains(&(level, reaction))
    }

    /// Lowest queued level.
    pub fn min_level(&self) -> Option<usize> {
        self.pending.iter().next().map(|(level, _)| *level)
    }

    /// Removes every reaction at the lowest level, in id order.
    pub fn pop_level(&mut self) -> Vec<ReactionId> {
        self.pop_eligible(|_| true)
    }

    /// Removes the reactions at the lowest level that has any reaction
    /// accepted by `eligible`; only accepted reactions are removed.
    pub fn pop_eligible(&mut self, eligible: impl Fn(ReactionId) -> bool) -> Vec<ReactionId> {
        let Some(level) = self
            .pending
            .iter()
            .find(|(_, r)| eligible(*r))
            .map(|(level, _)| *level)
        else {
            return Vec::new();
        };
        let batch: Vec<ReactionId> = self
            .pending
            .range((level, 0)..=(level, usize::MAX))
            .map(|(_, r)| *r)
            .filter(|r| eligible(*r))
            .collect();
        for &r in &batch {
            self.pending.remove(&(level, r));
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Forgets everything; called when a new tag starts.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortRef;
    use serde_json::json;

    // ========== EventQueue Tests ==========

    #[test]
    fn test_order_independent_of_insertion() {
        let events = vec![
            Event::timer(Tag::at(20), 0),
            Event::port(Tag::at(10), PortRef::single(3), json!(1)),
            Event::action(Tag::at(10), 0, None),
            Event::startup(Tag::ZERO),
        ];

        let mut forward = EventQueue::new();
        let mut backward = EventQueue::new();
        for e in events.iter().cloned() {
            forward.schedule(e);
        }
        for e in events.iter().rev().cloned() {
            backward.schedule(e);
        }

        for queue in [&mut forward, &mut backward] {
            assert_eq!(queue.next_tag(), Some(Tag::ZERO));
            queue.pop_tag(Tag::ZERO);
            let at_ten = queue.pop_tag(Tag::at(10));
            assert_eq!(at_ten[0].trigger, Trigger::Action(0));
            assert_eq!(at_ten[1].trigger, Trigger::Port(PortRef::single(3)));
            assert_eq!(queue.len(), 1);
        }
    }

    #[test]
    fn test_same_trigger_keeps_last_value() {
        let mut queue = EventQueue::new();
        assert!(!queue.schedule(Event::port(Tag::at(5), PortRef::single(0), json!("a"))));
        assert!(queue.schedule(Event::port(Tag::at(5), PortRef::single(0), json!("b"))));
        assert_eq!(queue.len(), 1);
        let events = queue.pop_tag(Tag::at(5));
        assert_eq!(events[0].payload, Some(json!("b")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_discard_after() {
        let mut queue = EventQueue::new();
        queue.schedule(Event::timer(Tag::at(5), 0));
        queue.schedule(Event::shutdown(Tag::at(10)));
        queue.schedule(Event::timer(Tag::new(10, 1), 0));
        queue.schedule(Event::timer(Tag::at(15), 0));
        assert_eq!(queue.discard_after(Tag::at(10)), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peak(), 4);
        assert_eq!(queue.discard_after(Tag::FOREVER), 0);
    }

    #[test]
    fn test_remove() {
        let mut queue = EventQueue::new();
        queue.schedule(Event::shutdown(Tag::at(10)));
        assert!(queue.remove(Tag::at(10), &Trigger::Shutdown));
        assert!(!queue.remove(Tag::at(10), &Trigger::Shutdown));
        assert_eq!(queue.next_tag(), None);
    }

    // ========== ReactionQueue Tests ==========

    #[test]
    fn test_pop_level_groups() {
        let mut rq = ReactionQueue::new();
        rq.push(1, 7);
        rq.push(0, 4);
        rq.push(0, 2);
        assert!(!rq.push(0, 2));
        assert_eq!(rq.min_level(), Some(0));
        assert_eq!(rq.pop_level(), vec![2, 4]);
        assert_eq!(rq.pop_level(), vec![7]);
        assert!(rq.is_empty());
        // still marked as seen for this tag
        assert!(!rq.push(3, 7));
        rq.clear();
        assert!(rq.push(3, 7));
    }

    #[test]
    fn test_pop_eligible_skips_blocked() {
        let mut rq = ReactionQueue::new();
        rq.push(0, 1);
        rq.push(0, 2);
        rq.push(2, 5);
        let batch = rq.pop_eligible(|r| r != 1 && r != 2);
        assert_eq!(batch, vec![5]);
        assert_eq!(rq.len(), 2);
        let batch = rq.pop_eligible(|r| r == 2);
        assert_eq!(batch, vec![2]);
        assert!(rq.pop_eligible(|_| false).is_empty());
    }
}
