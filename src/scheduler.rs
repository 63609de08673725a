//! The local scheduler.
//!
//! [`LocalScheduler`] owns a program's event queue, port table and reactor
//! bodies, and advances logical time one tag at a time:
//!
//! 1. **Select**: the next tag is the earliest tag in the event queue.
//! 2. **Wait**: unless running fast, wait until physical time reaches it.
//!    Federates additionally wait for a grant (see
//!    [`federated`](crate::federated)).
//! 3. **Fire**: pop the tag's events, run triggered reactions level by level
//!    with a barrier between levels, commit writes in reaction order and
//!    propagate them along connections.
//! 4. **Advance**: record the tag as completed.
//!
//! Same-tag propagation happens during commit; delayed connections and
//! actions become new events at later tags.
//!
//! # Example
//!
//! ```
//! use kairos::graph::ProgramBuilder;
//! use kairos::reaction::{reactor_fn, ReactionOutcome, ReactionSpec};
//! use kairos::scheduler::{LocalScheduler, SchedulerOptions};
//! use kairos::types::msec;
//!
//! let mut b = ProgramBuilder::new();
//! let r = b.add_reactor("clock");
//! let t = b.add_timer(r, "tick", 0, msec(10));
//! b.add_reaction(r, ReactionSpec::new().on_timer(t));
//! b.set_body(r, reactor_fn(|_, _| ReactionOutcome::Ok)).unwrap();
//!
//! let options = SchedulerOptions::default().with_fast(true).with_timeout(msec(30));
//! let mut scheduler = LocalScheduler::new(b.build().unwrap(), options);
//! let report = scheduler.run().unwrap();
//! assert_eq!(report.scheduler.tags_processed, 4);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::{GraphError, RuntimeError, RuntimeResult};
use crate::event::{Event, Trigger, TriggerSource};
use crate::graph::{ActionKind, Program};
use crate::port::{PortRef, PortTable, Value};
use crate::queue::{EventQueue, ReactionQueue};
use crate::reaction::{Effects, ReactionContext, ReactionOutcome, Reactor, ScheduleRequest};
use crate::stats::{RunReport, SchedulerStats, TagRecord, Timer};
use crate::tag::Tag;
use crate::types::{epoch_nanos, ActionId, Instant, Interval, PortId, ReactionId};
use crate::worker::WorkerPool;

/// Scheduler settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Do not wait for physical time to catch up with logical time.
    pub fast: bool,
    /// Logical time at which to stop.
    pub timeout: Option<Interval>,
    pub workers: usize,
    /// Wait for physical actions when the event queue runs dry.
    pub keepalive: bool,
    /// Record port values for every processed tag.
    pub trace: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            fast: false,
            timeout: None,
            workers: 1,
            keepalive: false,
            trace: false,
        }
    }
}

impl SchedulerOptions {
    pub fn with_fast(mut self, fast: bool) -> Self {
        self.fast = fast;
        self
    }

    pub fn with_timeout(mut self, timeout: Interval) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }
}

/// Where the scheduler is in its tag cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Nothing to do; waiting for physical actions.
    Idle,
    SelectTag,
    /// Blocked until the coordinator allows the next tag.
    WaitForGrant,
    FireReactions,
    Advance,
    Shutdown,
}

/// Network side of a federate, as seen by the scheduler while it processes
/// a tag. The default methods describe a scheduler with no network ports.
pub trait NetworkHooks {
    /// Network input ports whose status at `tag` is not known yet.
    fn unresolved_inputs(&mut self, tag: Tag) -> Vec<PortId> {
        let _ = tag;
        Vec::new()
    }

    /// Blocks until every port in `ports` is known at `tag` and returns the
    /// values that arrived for `tag`.
    fn resolve(&mut self, tag: Tag, ports: &[PortId]) -> RuntimeResult<Vec<Event>> {
        let _ = (tag, ports);
        Ok(Vec::new())
    }

    /// Sends the final value of a network output at `tag`.
    fn transmit(&mut self, tag: Tag, slot: PortRef, value: &Value) -> RuntimeResult<()> {
        let _ = (tag, slot, value);
        Ok(())
    }

    /// Announces that a network output stays absent at `tag`.
    fn announce_absent(&mut self, tag: Tag, slot: PortRef) -> RuntimeResult<()> {
        let _ = (tag, slot);
        Ok(())
    }
}

/// Hooks for a scheduler that is not part of a federation.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalOnly;

impl NetworkHooks for LocalOnly {}

struct PhysicalRequest {
    action: ActionId,
    extra_delay: Interval,
    value: Option<Value>,
    /// Physical time of the request, since start.
    at: Instant,
}

/// Requests from outside the scheduler thread.
struct PhysicalInbox {
    pending: Mutex<Vec<PhysicalRequest>>,
    wakeup: Condvar,
    start_epoch: AtomicI64,
}

impl PhysicalInbox {
    fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            wakeup: Condvar::new(),
            start_epoch: AtomicI64::new(epoch_nanos()),
        }
    }

    fn elapsed(&self) -> Instant {
        epoch_nanos() - self.start_epoch.load(Ordering::Acquire)
    }

    /// Queues a request stamped with the physical time at which it enters
    /// the inbox.
    fn push(&self, action: ActionId, extra_delay: Interval, value: Option<Value>) {
        let mut pending = self.pending.lock();
        pending.push(PhysicalRequest {
            action,
            extra_delay,
            value,
            at: self.elapsed(),
        });
        drop(pending);
        self.wakeup.notify_all();
    }

    /// Physical time now, or `None` while a request waits to be drained.
    /// Read under the inbox lock, so later requests are stamped no earlier.
    fn horizon(&self) -> Option<Instant> {
        let pending = self.pending.lock();
        if pending.is_empty() {
            Some(self.elapsed())
        } else {
            None
        }
    }

    fn drain(&self) -> Vec<PhysicalRequest> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Waits until a request is pending or `timeout` passes. Returns whether
    /// a request is pending.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            match timeout {
                Some(t) => {
                    self.wakeup.wait_for(&mut pending, t);
                }
                None => self.wakeup.wait(&mut pending),
            }
        }
        !pending.is_empty()
    }
}

/// Schedules a physical action from any thread.
#[derive(Clone)]
pub struct PhysicalActionHandle {
    action: ActionId,
    inbox: Arc<PhysicalInbox>,
}

impl PhysicalActionHandle {
    pub fn action(&self) -> ActionId {
        self.action
    }

    /// Schedules the action at the current physical time plus its minimum
    /// delay plus `extra_delay`.
    pub fn schedule(&self, extra_delay: Interval, value: Option<Value>) -> RuntimeResult<()> {
        let at = self.inbox.elapsed();
        if extra_delay < 0 {
            return Err(RuntimeError::TimeOrderViolation {
                attempted: Tag::at(at.saturating_add(extra_delay)),
                current: Tag::at(at),
            });
        }
        self.inbox.push(self.action, extra_delay, value);
        Ok(())
    }
}

struct FiredReaction {
    id: ReactionId,
    late: bool,
    outcome: ReactionOutcome,
    effects: Effects,
}

/// Executes one program.
pub struct LocalScheduler {
    program: Program,
    reactors: Vec<Box<dyn Reactor>>,
    options: SchedulerOptions,
    pool: WorkerPool,
    events: EventQueue,
    reactions: ReactionQueue,
    ports: PortTable,
    state: SchedulerState,
    current: Tag,
    stop_tag: Option<Tag>,
    /// Stop requested by a reaction, not yet applied.
    requested_stop: Option<Tag>,
    inbox: Arc<PhysicalInbox>,
    remote_inputs: BTreeSet<PortId>,
    remote_outputs: BTreeSet<PortId>,
    /// Network output channels already sent or announced absent this tag.
    announced: HashSet<PortRef>,
    stats: SchedulerStats,
    trace: Vec<TagRecord>,
    initialized: bool,
}

impl LocalScheduler {
    pub fn new(mut program: Program, options: SchedulerOptions) -> Self {
        let reactors = std::mem::take(&mut program.bodies);
        let ports = PortTable::new(&program.ports, program.actions.len());
        Self {
            reactors,
            pool: WorkerPool::new(options.workers),
            options,
            events: EventQueue::new(),
            reactions: ReactionQueue::new(),
            ports,
            state: SchedulerState::SelectTag,
            current: Tag::NEVER,
            stop_tag: None,
            requested_stop: None,
            inbox: Arc::new(PhysicalInbox::new()),
            remote_inputs: BTreeSet::new(),
            remote_outputs: BTreeSet::new(),
            announced: HashSet::new(),
            stats: SchedulerStats::default(),
            trace: Vec::new(),
            initialized: false,
            program,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Last tag processed, `NEVER` before the first.
    pub fn current_tag(&self) -> Tag {
        self.current
    }

    pub fn stop_tag(&self) -> Option<Tag> {
        self.stop_tag
    }

    pub fn is_shutdown(&self) -> bool {
        self.state == SchedulerState::Shutdown
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats.clone();
        stats.peak_queue_size = self.events.peak();
        stats
    }

    /// Recorded tag history (empty unless tracing is enabled).
    pub fn trace(&self) -> &[TagRecord] {
        &self.trace
    }

    /// Wall-clock nanoseconds at logical time zero.
    pub fn start_epoch(&self) -> i64 {
        self.inbox.start_epoch.load(Ordering::Acquire)
    }

    /// Aligns logical time zero with `epoch` (nanoseconds since the Unix
    /// epoch). Federates call this with the start time from the coordinator.
    pub fn set_start_epoch(&mut self, epoch: i64) {
        self.inbox.start_epoch.store(epoch, Ordering::Release);
    }

    /// Physical time elapsed since start.
    pub fn physical_elapsed(&self) -> Instant {
        self.inbox.elapsed()
    }

    /// Physical time elapsed since start, or `None` while a physical action
    /// request has not been absorbed yet. Requests made after this returns
    /// are stamped no earlier than the returned time.
    pub fn physical_horizon(&self) -> Option<Instant> {
        self.inbox.horizon()
    }

    /// Returns a handle for scheduling physical action `action` from other
    /// threads.
    pub fn physical_action(&self, action: ActionId) -> Result<PhysicalActionHandle, GraphError> {
        match self.program.actions.get(action) {
            Some(desc) if desc.kind == ActionKind::Physical => Ok(PhysicalActionHandle {
                action,
                inbox: Arc::clone(&self.inbox),
            }),
            _ => Err(GraphError::UnknownId {
                kind: "physical action",
                id: action,
            }),
        }
    }

    /// Marks `port` as fed from another federate.
    pub fn mark_remote_input(&mut self, port: PortId) -> Result<(), GraphError> {
        self.check_port(port)?;
        self.remote_inputs.insert(port);
        Ok(())
    }

    /// Marks `port` as sent to another federate.
    pub fn mark_remote_output(&mut self, port: PortId) -> Result<(), GraphError> {
        self.check_port(port)?;
        self.remote_outputs.insert(port);
        Ok(())
    }

    fn check_port(&self, port: PortId) -> Result<(), GraphError> {
        if port < self.program.ports.len() {
            Ok(())
        } else {
            Err(GraphError::UnknownId { kind: "port", id: port })
        }
    }

    /// Schedules startup, the first firing of every timer and the timeout.
    pub fn initialize(&mut self) -> RuntimeResult<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        self.schedule_internal(Event::startup(Tag::ZERO));
        for (id, timer) in self.program.timers.iter().enumerate() {
            if timer.offset < 0 {
                return Err(RuntimeError::TimeOrderViolation {
                    attempted: Tag::at(timer.offset),
                    current: Tag::ZERO,
                });
            }
            let event = Event::timer(Tag::at(timer.offset), id);
            self.events.schedule(event);
            self.stats.events_scheduled += 1;
        }
        if let Some(timeout) = self.options.timeout {
            self.set_stop_tag(Tag::at(timeout))?;
        }
        info!(
            reactors = self.program.reactors.len(),
            reactions = self.program.reactions.len(),
            workers = self.pool.workers(),
            fast = self.options.fast,
            "scheduler initialized"
        );
        Ok(())
    }

    /// Earliest pending tag, after absorbing physical action requests.
    pub fn next_tag(&mut self) -> Option<Tag> {
        self.absorb_physical();
        self.events.next_tag()
    }

    /// Inserts an event produced outside this scheduler, such as a network
    /// message. The tag must be later than the current tag.
    pub fn schedule_external(&mut self, event: Event) -> RuntimeResult<()> {
        if !self.current.is_never() && event.tag <= self.current {
            return Err(RuntimeError::TimeOrderViolation {
                attempted: event.tag,
                current: self.current,
            });
        }
        self.schedule_internal(event);
        Ok(())
    }

    fn schedule_internal(&mut self, event: Event) {
        if self.stop_tag.map_or(false, |stop| event.tag > stop) {
            trace!(tag = %event.tag, "event after stop tag discarded");
            self.stats.events_discarded += 1;
            return;
        }
        self.events.schedule(event);
        self.stats.events_scheduled += 1;
    }

    /// Sets the tag at which shutdown reactions run. An earlier stop tag
    /// already in place wins. Events after the stop tag are discarded.
    pub fn set_stop_tag(&mut self, tag: Tag) -> RuntimeResult<()> {
        if !self.current.is_never() && tag <= self.current {
            return Err(RuntimeError::TimeOrderViolation {
                attempted: tag,
                current: self.current,
            });
        }
        if let Some(existing) = self.stop_tag {
            if existing <= tag {
                return Ok(());
            }
            self.events.remove(existing, &Trigger::Shutdown);
        }
        self.stop_tag = Some(tag);
        self.events.schedule(Event::shutdown(tag));
        let dropped = self.events.discard_after(tag);
        self.stats.events_discarded += dropped as u64;
        info!(stop = %tag, dropped, "stop tag set");
        Ok(())
    }

    /// Stop tag asked for by a reaction since the last call.
    pub fn take_stop_request(&mut self) -> Option<Tag> {
        self.requested_stop.take()
    }

    /// Lets a federate report that it is blocked outside the scheduler.
    pub(crate) fn set_state(&mut self, state: SchedulerState) {
        self.state = state;
    }

    /// Waits until physical time reaches `tag`. Returns `false` when a
    /// physical action arrived first and the next tag should be selected
    /// again.
    pub fn wait_for_physical(&mut self, tag: Tag) -> bool {
        if self.options.fast || tag.is_forever() {
            return true;
        }
        loop {
            let now = self.physical_elapsed();
            if now >= tag.time {
                return true;
            }
            let remaining = Duration::from_nanos(u64::try_from(tag.time - now).unwrap_or(0));
            if self.inbox.wait(Some(remaining)) {
                return false;
            }
        }
    }

    fn absorb_physical(&mut self) {
        for request in self.inbox.drain() {
            let min_delay = self
                .program
                .actions
                .get(request.action)
                .map_or(0, |a| a.min_delay);
            let mut tag = Tag::at(
                request
                    .at
                    .saturating_add(min_delay)
                    .saturating_add(request.extra_delay),
            )
            .max(Tag::ZERO);
            if !self.current.is_never() && tag <= self.current {
                tag = self.current.next_microstep();
            }
            debug!(action = request.action, %tag, "physical action");
            self.schedule_internal(Event::action(tag, request.action, request.value));
        }
    }

    /// Runs every reaction triggered at `tag`.
    ///
    /// The caller guarantees that `tag` is safe to process; `net` resolves
    /// network inputs that are still unknown and carries network outputs.
    pub fn process_tag(&mut self, tag: Tag, net: &mut dyn NetworkHooks) -> RuntimeResult<()> {
        self.initialize()?;
        if !self.current.is_never() && tag <= self.current {
            return Err(RuntimeError::TimeOrderViolation {
                attempted: tag,
                current: self.current,
            });
        }
        if let Some(stop) = self.stop_tag {
            if tag > stop {
                return Err(RuntimeError::TimeOrderViolation {
                    attempted: tag,
                    current: stop,
                });
            }
        }

        self.state = SchedulerState::FireReactions;
        self.current = tag;
        self.ports.reset();
        self.reactions.clear();
        self.announced.clear();
        debug!(%tag, "processing tag");

        for event in self.events.pop_tag(tag) {
            self.apply_event(event)?;
        }
        self.run_reactions(net)?;

        self.state = SchedulerState::Advance;
        self.stats.tags_processed += 1;
        if self.options.trace {
            self.trace.push(TagRecord {
                tag,
                values: self.ports.snapshot(),
            });
        }

        if self.stop_tag.map_or(false, |stop| tag >= stop) {
            let dropped = self.events.discard_after(Tag::NEVER);
            self.stats.events_discarded += dropped as u64;
            self.state = SchedulerState::Shutdown;
            info!(%tag, "shutdown complete");
        } else {
            self.state = SchedulerState::SelectTag;
        }
        Ok(())
    }

    fn apply_event(&mut self, event: Event) -> RuntimeResult<()> {
        match event.trigger {
            Trigger::Startup | Trigger::Shutdown => self.trigger(event.trigger.source()),
            Trigger::Timer(timer) => {
                self.trigger(TriggerSource::Timer(timer));
                let period = self.program.timers.get(timer).map_or(0, |t| t.period);
                if period > 0 {
                    let next = self.current.after(period);
                    self.schedule_internal(Event::timer(next, timer));
                }
            }
            Trigger::Action(action) => {
                self.ports
                    .set_action(action, Some(event.payload.unwrap_or(Value::Null)));
                self.trigger(TriggerSource::Action(action));
            }
            Trigger::Port(slot) => {
                if let Some(value) = event.payload {
                    self.write_port(slot, value)?;
                }
            }
        }
        Ok(())
    }

    fn trigger(&mut self, source: TriggerSource) {
        for &id in self.program.triggered_by(source) {
            let level = self.program.reactions[id].level;
            self.reactions.push(level, id);
        }
    }

    /// Sets a port at the current tag and follows its connections.
    fn write_port(&mut self, slot: PortRef, value: Value) -> RuntimeResult<()> {
        if !self.ports.set(slot, value.clone()) {
            return Err(GraphError::UnknownId {
                kind: "port",
                id: slot.port,
            }
            .into());
        }
        self.trigger(TriggerSource::Port(slot.port));

        let edges: Vec<_> = self.program.connections.outgoing(slot).copied().collect();
        for edge in edges {
            if edge.is_instantaneous() {
                self.write_port(edge.dst, value.clone())?;
            } else {
                let arrival = edge.arrival_tag(self.current);
                self.schedule_internal(Event::port(arrival, edge.dst, value.clone()));
            }
        }
        Ok(())
    }

    fn run_reactions(&mut self, net: &mut dyn NetworkHooks) -> RuntimeResult<()> {
        loop {
            let unresolved: Vec<PortId> = if self.remote_inputs.is_empty() {
                Vec::new()
            } else {
                net.unresolved_inputs(self.current)
                    .into_iter()
                    .filter(|&p| self.program.dependents_level(p).is_some())
                    .collect()
            };
            self.flush_remote_outputs(&unresolved, net)?;

            if self.reactions.is_empty() {
                if unresolved.is_empty() {
                    return Ok(());
                }
                self.resolve_inputs(&unresolved, net)?;
                continue;
            }

            let batch = if unresolved.is_empty() {
                self.reactions.pop_level()
            } else {
                let program = &self.program;
                self.reactions.pop_eligible(|r| {
                    !unresolved.iter().any(|&p| program.depends_on_input(r, p))
                })
            };
            if batch.is_empty() {
                self.resolve_inputs(&unresolved, net)?;
                continue;
            }
            self.fire(batch)?;
        }
    }

    fn resolve_inputs(&mut self, ports: &[PortId], net: &mut dyn NetworkHooks) -> RuntimeResult<()> {
        trace!(tag = %self.current, ?ports, "resolving network inputs");
        for event in net.resolve(self.current, ports)? {
            if event.tag != self.current {
                return Err(RuntimeError::Protocol(format!(
                    "input resolved for {} while processing {}",
                    event.tag, self.current
                )));
            }
            self.apply_event(event)?;
        }
        Ok(())
    }

    /// Sends each network output once none of its writers can still run at
    /// this tag.
    fn flush_remote_outputs(
        &mut self,
        unresolved: &[PortId],
        net: &mut dyn NetworkHooks,
    ) -> RuntimeResult<()> {
        if self.remote_outputs.is_empty() {
            return Ok(());
        }
        let min_pending = self.reactions.min_level();
        let outputs: Vec<PortId> = self.remote_outputs.iter().copied().collect();
        for port in outputs {
            let settled = self.program.writers(port).iter().all(|&w| {
                let level = self.program.reactions[w].level;
                if self.reactions.has_seen(w) {
                    return self.reactions.has_run(level, w);
                }
                min_pending.map_or(true, |m| level < m)
                    && !unresolved
                        .iter()
                        .any(|&p| self.program.depends_on_input(w, p))
            });
            if !settled {
                continue;
            }
            let width = self.program.ports[port].width;
            for channel in 0..width {
                let slot = PortRef::new(port, channel);
                if !self.announced.insert(slot) {
                    continue;
                }
                match self.ports.get(slot).cloned() {
                    Some(value) => net.transmit(self.current, slot, &value)?,
                    None => net.announce_absent(self.current, slot)?,
                }
            }
        }
        Ok(())
    }

    /// Runs one batch of independent reactions and commits their effects.
    fn fire(&mut self, batch: Vec<ReactionId>) -> RuntimeResult<()> {
        let tag = self.current;
        let physical = self.physical_elapsed();
        let epoch = self.start_epoch();
        if batch.len() > 1 && self.pool.is_parallel() {
            self.stats.parallel_levels += 1;
        }

        let results: Vec<FiredReaction> = {
            let reactions = &self.program.reactions;
            let ports = &self.ports;
            let mut slots: Vec<Option<&mut Box<dyn Reactor>>> =
                self.reactors.iter_mut().map(Some).collect();
            let mut jobs = Vec::with_capacity(batch.len());
            for &id in &batch {
                let owner = reactions[id].reactor;
                let body = slots
                    .get_mut(owner)
                    .and_then(Option::take)
                    .ok_or_else(|| {
                        RuntimeError::Protocol(format!(
                            "reactor {owner} has two reactions in one level"
                        ))
                    })?;
                jobs.push((id, body));
            }

            self.pool.map(jobs, |(id, body)| {
                let desc = &reactions[id];
                let mut ctx = ReactionContext::new(tag, epoch, ports);
                let late = desc
                    .deadline
                    .map_or(false, |deadline| physical.saturating_sub(tag.time) > deadline);
                let outcome = if late {
                    body.deadline_violated(desc.index, &mut ctx)
                } else {
                    body.react(desc.index, &mut ctx)
                };
                FiredReaction {
                    id,
                    late,
                    outcome,
                    effects: ctx.into_effects(),
                }
            })
        };

        let mut writes: BTreeMap<PortRef, Value> = BTreeMap::new();
        let mut schedules: Vec<ScheduleRequest> = Vec::new();
        for fired in results {
            let desc = &self.program.reactions[fired.id];
            self.stats.reactions_fired += 1;
            if fired.late {
                self.stats.deadline_violations += 1;
                warn!(
                    reaction = %self.program.reaction_name(fired.id),
                    %tag,
                    "deadline violated"
                );
            }
            if let ReactionOutcome::Fatal(reason) = fired.outcome {
                return Err(RuntimeError::ReactionFault {
                    reactor: self.program.reactor_name(desc.reactor).to_string(),
                    reaction: desc.index,
                    tag,
                    reason,
                });
            }
            for (slot, value) in fired.effects.writes {
                if !desc.may_write(slot.port) {
                    return Err(RuntimeError::UndeclaredEffect {
                        reactor: self.program.reactor_name(desc.reactor).to_string(),
                        reaction: desc.index,
                        target: self.program.port_name(slot.port),
                    });
                }
                // later reactions in id order overwrite earlier ones
                writes.insert(slot, value);
            }
            for request in fired.effects.schedules {
                if !desc.may_schedule(request.action) {
                    return Err(RuntimeError::UndeclaredEffect {
                        reactor: self.program.reactor_name(desc.reactor).to_string(),
                        reaction: desc.index,
                        target: format!("action {}", request.action),
                    });
                }
                schedules.push(request);
            }
            if fired.effects.stop_requested {
                let stop = tag.next_microstep();
                self.requested_stop = Some(self.requested_stop.map_or(stop, |s| s.min(stop)));
            }
        }

        for (slot, value) in writes {
            self.write_port(slot, value)?;
        }
        for request in schedules {
            self.schedule_action(request)?;
        }
        Ok(())
    }

    fn schedule_action(&mut self, request: ScheduleRequest) -> RuntimeResult<()> {
        let (kind, min_delay) = match self.program.actions.get(request.action) {
            Some(a) => (a.kind, a.min_delay),
            None => {
                return Err(GraphError::UnknownId {
                    kind: "action",
                    id: request.action,
                }
                .into())
            }
        };
        let delay = min_delay.saturating_add(request.extra_delay);
        let tag = match kind {
            ActionKind::Logical => {
                if request.extra_delay < 0 || delay < 0 {
                    return Err(RuntimeError::TimeOrderViolation {
                        attempted: Tag::at(self.current.time.saturating_add(delay)),
                        current: self.current,
                    });
                }
                self.current.after(delay)
            }
            ActionKind::Physical => {
                if request.extra_delay < 0 {
                    return Err(RuntimeError::TimeOrderViolation {
                        attempted: Tag::at(self.physical_elapsed().saturating_add(delay)),
                        current: self.current,
                    });
                }
                Tag::at(self.physical_elapsed().saturating_add(delay))
                    .max(self.current.next_microstep())
            }
        };
        self.schedule_internal(Event::action(tag, request.action, request.value));
        Ok(())
    }

    /// Runs the program until shutdown without any network.
    pub fn run(&mut self) -> RuntimeResult<RunReport> {
        let timer = Timer::start();
        self.initialize()?;
        loop {
            self.state = SchedulerState::SelectTag;
            let Some(tag) = self.next_tag() else {
                if self.options.keepalive {
                    self.state = SchedulerState::Idle;
                    self.inbox.wait(None);
                    continue;
                }
                let stop = if self.current.is_never() {
                    Tag::ZERO
                } else {
                    self.current.next_microstep()
                };
                debug!(stop = %stop, "event queue empty");
                self.set_stop_tag(stop)?;
                continue;
            };
            if !self.wait_for_physical(tag) {
                continue;
            }
            self.process_tag(tag, &mut LocalOnly)?;
            if let Some(stop) = self.take_stop_request() {
                self.set_stop_tag(stop)?;
            }
            if self.is_shutdown() {
                break;
            }
        }
        Ok(self.report("local", timer.elapsed_ms()))
    }

    /// Summarises the run so far, handing over the recorded trace.
    pub fn report(&mut self, name: &str, wall_time_ms: f64) -> RunReport {
        RunReport {
            name: name.to_string(),
            final_tag: self.current,
            wall_time_ms,
            scheduler: self.stats(),
            federate: None,
            trace: std::mem::take(&mut self.trace),
        }
    }
}
