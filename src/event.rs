//! Events and the triggers they carry.
//!
//! An event is a pending trigger at a tag, optionally with a value. Triggers
//! are totally ordered so that events sharing a tag are always handled in
//! the same order, independent of how they were scheduled.

use serde::{Deserialize, Serialize};

use crate::port::{PortRef, Value};
use crate::tag::Tag;
use crate::types::{ActionId, PortId, TimerId};

/// What an event fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Trigger {
    Startup,
    Timer(TimerId),
    Action(ActionId),
    /// A value arriving on one channel of a port through a delayed or
    /// network connection.
    Port(PortRef),
    Shutdown,
}

impl Trigger {
    /// The reaction-level trigger this event activates.
    pub fn source(&self) -> TriggerSource {
        match *self {
            Trigger::Startup => TriggerSource::Startup,
            Trigger::Timer(t) => TriggerSource::Timer(t),
            Trigger::Action(a) => TriggerSource::Action(a),
            Trigger::Port(slot) => TriggerSource::Port(slot.port),
            Trigger::Shutdown => TriggerSource::Shutdown,
        }
    }
}

/// A trigger as declared by a reaction. Ports are named as a whole, so a
/// reaction triggered by a multiport fires when any of its channels is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TriggerSource {
    Startup,
    Timer(TimerId),
    Action(ActionId),
    Port(PortId),
    Shutdown,
}

/// A trigger pending at a tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub tag: Tag,
    pub trigger: Trigger,
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(tag: Tag, trigger: Trigger, payload: Option<Value>) -> Self {
        Self {
            tag,
            trigger,
            payload,
        }
    }

    pub fn startup(tag: Tag) -> Self {
        Self::new(tag, Trigger::Startup, None)
    }

    pub fn shutdown(tag: Tag) -> Self {
        Self::new(tag, Trigger::Shutdown, None)
    }

    pub fn timer(tag: Tag, timer: TimerId) -> Self {
        Self::new(tag, Trigger::Timer(timer), None)
    }

    pub fn action(tag: Tag, action: ActionId, payload: Option<Value>) -> Self {
        Self::new(tag, Trigger::Action(action), payload)
    }

    /// A value for `slot` at `tag`.
    pub fn port(tag: Tag, slot: PortRef, value: Value) -> Self {
        Self::new(tag, Trigger::Port(slot), Some(value))
    }
}
