//! Ports and the per-tag value table.
//!
//! Every port has a fixed width (1 for a plain port, N for a multiport).
//! Values live in a [`PortTable`] that is cleared at the start of each tag:
//! presence never carries over from one tag to the next.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ActionId, PortId, ReactorId};

/// Payload type carried by ports, actions and network messages.
pub type Value = serde_json::Value;

/// Direction of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    Input,
    Output,
}

/// Static description of a port.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortDesc {
    /// Local name, unique within the owning reactor.
    pub name: String,
    /// Owning reactor.
    pub reactor: ReactorId,
    pub kind: PortKind,
    /// Number of channels (1 unless this is a multiport).
    pub width: usize,
}

/// One channel of one port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub port: PortId,
    pub channel: usize,
}

impl PortRef {
    pub const fn new(port: PortId, channel: usize) -> Self {
        Self { port, channel }
    }

    /// Channel 0 of `port`.
    pub const fn single(port: PortId) -> Self {
        Self { port, channel: 0 }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}[{}]", self.port, self.channel)
    }
}

/// Values present at the current tag, for every port channel and action.
#[derive(Clone, Debug, Default)]
pub struct PortTable {
    ports: Vec<Vec<Option<Value>>>,
    actions: Vec<Option<Value>>,
    /// Slots written since the last reset.
    dirty: Vec<PortRef>,
    dirty_actions: Vec<ActionId>,
}

impl PortTable {
    /// Creates an empty table shaped after `ports`, with `actions` action slots.
    pub fn new(ports: &[PortDesc], actions: usize) -> Self {
        Self {
            ports: ports.iter().map(|p| vec![None; p.width]).collect(),
            actions: vec![None; actions],
            dirty: Vec::new(),
            dirty_actions: Vec::new(),
        }
    }

    /// Width of a port, or `None` if it does not exist.
    pub fn width(&self, port: PortId) -> Option<usize> {
        self.ports.get(port).map(Vec::len)
    }

    pub fn get(&self, slot: PortRef) -> Option<&Value> {
        self.ports
            .get(slot.port)
            .and_then(|channels| channels.get(slot.channel))
            .and_then(Option::as_ref)
    }

    pub fn is_present(&self, slot: PortRef) -> bool {
        self.get(slot).is_some()
    }

    /// Stores `value`, replacing any earlier value at this tag.
    ///
    /// Returns `false` if the slot does not exist.
    pub fn set(&mut self, slot: PortRef, value: Value) -> bool {
        let Some(cell) = self
            .ports
            .get_mut(slot.port)
            .and_then(|channels| channels.get_mut(slot.channel))
        else {
            return false;
        };
        if cell.is_none() {
            self.dirty.push(slot);
        }
        *cell = Some(value);
        true
    }

    /// Value carried by an action at the current tag.
    pub fn action(&self, action: ActionId) -> Option<&Value> {
        self.actions.get(action).and_then(Option::as_ref)
    }

    pub fn set_action(&mut self, action: ActionId, value: Option<Value>) {
        if let Some(cell) = self.actions.get_mut(action) {
            if cell.is_none() {
                self.dirty_actions.push(action);
            }
            *cell = value;
        }
    }

    /// Clears every value written since the last reset.
    pub fn reset(&mut self) {
        for slot in self.dirty.drain(..) {
            if let Some(cell) = self
                .ports
                .get_mut(slot.port)
                .and_then(|channels| channels.get_mut(slot.channel))
            {
                *cell = None;
            }
        }
        for action in self.dirty_actions.drain(..) {
            if let Some(cell) = self.actions.get_mut(action) {
                *cell = None;
            }
        }
    }

    /// Every present port value, ordered by slot.
    pub fn snapshot(&self) -> Vec<(PortRef, Value)> {
        let mut present: Vec<(PortRef, Value)> = self
            .dirty
            .iter()
            .filter_map(|&slot| self.get(slot).map(|v| (slot, v.clone())))
            .collect();
        present.sort_by_key(|(slot, _)| *slot);
        present
    }
}
