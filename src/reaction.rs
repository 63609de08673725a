//! Reactions, reactor bodies and the context a reaction runs with.
//!
//! A reactor body implements [`Reactor`]; the scheduler calls
//! [`Reactor::react`] with the local index of the reaction to run. The body
//! reads inputs and writes outputs through a [`ReactionContext`]. Writes and
//! schedules are buffered in the context and committed by the scheduler
//! once every reaction of the level has returned, in reaction order.
//!
//! # Example
//!
//! ```
//! use kairos::reaction::{reactor_fn, ReactionOutcome};
//! use serde_json::json;
//!
//! let out = 0; // port id returned by ProgramBuilder::add_output
//! let body = reactor_fn(move |_reaction, ctx| {
//!     ctx.set(out, json!(42));
//!     ReactionOutcome::Ok
//! });
//! # let _ = body;
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::event::TriggerSource;
use crate::port::{PortRef, PortTable, Value};
use crate::tag::Tag;
use crate::types::{epoch_nanos, ActionId, Instant, Interval, PortId, ReactorId};

/// Result of running one reaction body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReactionOutcome {
    Ok,
    /// Stop this federate; the reason is reported upstream of the error.
    Fatal(String),
}

/// Something a reaction may write or schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Effect {
    Port(PortId),
    Action(ActionId),
}

/// User code for one reactor instance.
pub trait Reactor: Send {
    /// Runs reaction `reaction` (index in declaration order within this
    /// reactor).
    fn react(&mut self, reaction: usize, ctx: &mut ReactionContext<'_>) -> ReactionOutcome;

    /// Runs instead of `react` when the reaction starts later than its
    /// deadline allows.
    fn deadline_violated(
        &mut self,
        reaction: usize,
        ctx: &mut ReactionContext<'_>,
    ) -> ReactionOutcome {
        let _ = (reaction, ctx);
        ReactionOutcome::Ok
    }
}

/// Adapts a closure into a [`Reactor`].
pub struct ReactorFn<F> {
    body: F,
}

impl<F> Reactor for ReactorFn<F>
where
    F: FnMut(usize, &mut ReactionContext<'_>) -> ReactionOutcome + Send,
{
    fn react(&mut self, reaction: usize, ctx: &mut ReactionContext<'_>) -> ReactionOutcome {
        (self.body)(reaction, ctx)
    }
}

/// Boxes a closure as a reactor body.
pub fn reactor_fn<F>(body: F) -> Box<dyn Reactor>
where
    F: FnMut(usize, &mut ReactionContext<'_>) -> ReactionOutcome + Send + 'static,
{
    Box::new(ReactorFn { body })
}

/// Declaration of a reaction, built with chained calls.
///
/// ```
/// use kairos::reaction::ReactionSpec;
/// use kairos::types::msec;
///
/// let spec = ReactionSpec::new()
///     .on_port(0)
///     .reads(1)
///     .writes(2)
///     .with_deadline(msec(5));
/// assert_eq!(spec.triggers.len(), 1);
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReactionSpec {
    pub triggers: Vec<TriggerSource>,
    /// Ports read without triggering.
    pub sources: Vec<PortId>,
    pub effects: Vec<Effect>,
    pub deadline: Option<Interval>,
}

impl ReactionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggered_by(mut self, trigger: TriggerSource) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn on_startup(self) -> Self {
        self.triggered_by(TriggerSource::Startup)
    }

    pub fn on_shutdown(self) -> Self {
        self.triggered_by(TriggerSource::Shutdown)
    }

    pub fn on_timer(self, timer: usize) -> Self {
        self.triggered_by(TriggerSource::Timer(timer))
    }

    pub fn on_action(self, action: ActionId) -> Self {
        self.triggered_by(TriggerSource::Action(action))
    }

    pub fn on_port(self, port: PortId) -> Self {
        self.triggered_by(TriggerSource::Port(port))
    }

    pub fn reads(mut self, port: PortId) -> Self {
        self.sources.push(port);
        self
    }

    pub fn writes(mut self, port: PortId) -> Self {
        self.effects.push(Effect::Port(port));
        self
    }

    pub fn schedules(mut self, action: ActionId) -> Self {
        self.effects.push(Effect::Action(action));
        self
    }

    pub fn with_deadline(mut self, deadline: Interval) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A reaction as placed in a program.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReactionDesc {
    pub reactor: ReactorId,
    /// Index within the reactor.
    pub index: usize,
    pub triggers: Vec<TriggerSource>,
    pub sources: Vec<PortId>,
    pub effects: Vec<Effect>,
    pub deadline: Option<Interval>,
    /// Topological level; set when the program is built.
    pub level: usize,
}

impl ReactionDesc {
    /// Ports this reaction may observe, triggering or not.
    pub fn observed_ports(&self) -> impl Iterator<Item = PortId> + '_ {
        self.triggers
            .iter()
            .filter_map(|t| match t {
                TriggerSource::Port(p) => Some(*p),
                _ => None,
            })
            .chain(self.sources.iter().copied())
    }

    /// Ports this reaction may write.
    pub fn written_ports(&self) -> impl Iterator<Item = PortId> + '_ {
        self.effects.iter().filter_map(|e| match e {
            Effect::Port(p) => Some(*p),
            Effect::Action(_) => None,
        })
    }

    pub fn may_write(&self, port: PortId) -> bool {
        self.effects.contains(&Effect::Port(port))
    }

    pub fn may_schedule(&self, action: ActionId) -> bool {
        self.effects.contains(&Effect::Action(action))
    }
}

/// A buffered action schedule request.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleRequest {
    pub action: ActionId,
    pub extra_delay: Interval,
    pub value: Option<Value>,
}

/// Everything a reaction produced, handed back to the scheduler.
#[derive(Clone, Debug, Default)]
pub struct Effects {
    pub writes: Vec<(PortRef, Value)>,
    pub schedules: Vec<ScheduleRequest>,
    pub stop_requested: bool,
}

/// View of the current tag given to a reaction body.
pub struct ReactionContext<'a> {
    tag: Tag,
    start_epoch: i64,
    ports: &'a PortTable,
    effects: Effects,
}

impl<'a> ReactionContext<'a> {
    pub(crate) fn new(tag: Tag, start_epoch: i64, ports: &'a PortTable) -> Self {
        Self {
            tag,
            start_epoch,
            ports,
            effects: Effects::default(),
        }
    }

    /// Current logical tag.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Current logical time.
    pub fn logical_time(&self) -> Instant {
        self.tag.time
    }

    /// Physical time elapsed since start.
    pub fn physical_time(&self) -> Instant {
        epoch_nanos() - self.start_epoch
    }

    /// Value on channel 0 of `port`, if present at this tag. A port this
    /// reaction has written reads back its latest write.
    pub fn get(&self, port: PortId) -> Option<&Value> {
        self.get_channel(port, 0)
    }

    pub fn get_channel(&self, port: PortId, channel: usize) -> Option<&Value> {
        let slot = PortRef::new(port, channel);
        self.own_write(slot).or_else(|| self.ports.get(slot))
    }

    fn own_write(&self, slot: PortRef) -> Option<&Value> {
        self.effects
            .writes
            .iter()
            .rev()
            .find(|(written, _)| *written == slot)
            .map(|(_, value)| value)
    }

    /// Deserializes the value on channel 0 of `port`.
    pub fn get_as<T: DeserializeOwned>(&self, port: PortId) -> Option<T> {
        self.get(port)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn is_present(&self, port: PortId) -> bool {
        let slot = PortRef::single(port);
        self.own_write(slot).is_some() || self.ports.is_present(slot)
    }

    /// Number of channels of `port`.
    pub fn width(&self, port: PortId) -> usize {
        self.ports.width(port).unwrap_or(0)
    }

    /// Value carried by `action` at this tag.
    pub fn action_value(&self, action: ActionId) -> Option<&Value> {
        self.ports.action(action)
    }

    pub fn is_triggered(&self, action: ActionId) -> bool {
        self.action_value(action).is_some()
    }

    /// Writes channel 0 of `port`. A later write at the same tag replaces it.
    pub fn set(&mut self, port: PortId, value: impl Into<Value>) {
        self.set_channel(port, 0, value);
    }

    pub fn set_channel(&mut self, port: PortId, channel: usize, value: impl Into<Value>) {
        self.effects
            .writes
            .push((PortRef::new(port, channel), value.into()));
    }

    /// Schedules `action` after its minimum delay plus `extra_delay`.
    pub fn schedule(&mut self, action: ActionId, extra_delay: Interval, value: Option<Value>) {
        self.effects.schedules.push(ScheduleRequest {
            action,
            extra_delay,
            value,
        });
    }

    /// Asks for the execution to end at the next microstep.
    pub fn request_stop(&mut self) {
        self.effects.stop_requested = true;
    }

    pub(crate) fn into_effects(self) -> Effects {
        self.effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{PortDesc, PortKind};
    use serde_json::json;

    fn table() -> PortTable {
        let ports = vec![PortDesc {
            name: "in".into(),
            reactor: 0,
            kind: PortKind::Input,
            width: 2,
        }];
        let mut table = PortTable::new(&ports, 1);
        table.set(PortRef::new(0, 1), json!({"x": 3}));
        table
    }

    #[test]
    fn test_context_reads() {
        let table = table();
        let ctx = ReactionContext::new(Tag::at(5), 0, &table);
        assert!(!ctx.is_present(0));
        assert_eq!(ctx.get_channel(0, 1), Some(&json!({"x": 3})));
        assert_eq!(ctx.width(0), 2);
        assert_eq!(ctx.logical_time(), 5);
    }

    #[test]
    fn test_context_buffers_effects() {
        let table = table();
        let mut ctx = ReactionContext::new(Tag::ZERO, 0, &table);
        ctx.set(0, 1);
        ctx.set_channel(0, 1, "two");
        ctx.schedule(0, 10, None);
        ctx.request_stop();
        // own writes read back, latest first
        assert!(ctx.is_present(0));
        assert_eq!(ctx.get(0), Some(&json!(1)));
        ctx.set(0, 4);
        assert_eq!(ctx.get_as::<i64>(0), Some(4));
        assert_eq!(ctx.get_channel(0, 1), Some(&json!("two")));

        let effects = ctx.into_effects();
        assert_eq!(effects.writes.len(), 3);
        assert_eq!(effects.schedules[0].extra_delay, 10);
        assert!(effects.stop_requested);
    }

    #[test]
    fn test_reactor_fn_dispatch() {
        let table = table();
        let mut calls = Vec::new();
        let mut body = reactor_fn(|reaction, _ctx| {
            if reaction == 1 {
                ReactionOutcome::Fatal("bad input".into())
            } else {
                ReactionOutcome::Ok
            }
        });
        let mut ctx = ReactionContext::new(Tag::ZERO, 0, &table);
        calls.push(body.react(0, &mut ctx));
        calls.push(body.react(1, &mut ctx));
        calls.push(body.deadline_violated(1, &mut ctx));
        assert_eq!(
            calls,
            vec![
                ReactionOutcome::Ok,
                ReactionOutcome::Fatal("bad input".into()),
                ReactionOutcome::Ok
            ]
        );
    }

    #[test]
    fn test_spec_builder() {
        let spec = ReactionSpec::new()
            .on_startup()
            .on_port(3)
            .reads(4)
            .writes(5)
            .schedules(1);
        assert_eq!(spec.triggers, vec![TriggerSource::Startup, TriggerSource::Port(3)]);
        assert_eq!(spec.effects, vec![Effect::Port(5), Effect::Action(1)]);
    }
}
