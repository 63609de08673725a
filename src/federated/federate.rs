//! A federate: a local scheduler gated by the time-advance protocol.
//!
//! Before processing a tag the federate makes sure no message at or before
//! that tag can still arrive:
//!
//! - **Centralized**: it reports its next event tag and waits for a grant.
//!   Under a provisional grant it starts the tag anyway and blocks only the
//!   reactions that depend on a network input still unresolved at that tag.
//! - **Decentralized**: it waits until every network input is known up to
//!   the tag, or until physical time passes the tag plus the safe-to-advance
//!   offset. A message arriving after that is a time order violation.
//!
//! Network outputs are transmitted as soon as every reaction that could
//! still write them at the current tag is done; outputs that stay empty are
//! announced absent so downstream federates need not wait for the tag to
//! complete.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{CoordinationMode, GrantTimeoutPolicy};
use crate::error::{GraphError, RuntimeError, RuntimeResult};
use crate::event::Event;
use crate::federated::message::Message;
use crate::federated::topology::ConnectionEntry;
use crate::federated::transport::{Endpoint, Inbound, Link};
use crate::graph::Program;
use crate::port::{PortRef, Value};
use crate::scheduler::{
    LocalScheduler, NetworkHooks, PhysicalActionHandle, SchedulerOptions, SchedulerState,
};
use crate::stats::{FederateStats, RunReport, Timer};
use crate::tag::Tag;
use crate::types::{ActionId, FederateId, Interval, PortId};

/// How often a federate with physical inputs refreshes its next event tag.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Settings of one federate.
#[derive(Clone, Debug)]
pub struct FederateOptions {
    pub id: FederateId,
    pub name: String,
    pub coordination: CoordinationMode,
    /// Bound on a single wait for a grant or a network input.
    pub grant_timeout: Duration,
    pub grant_timeout_policy: GrantTimeoutPolicy,
    /// Safe-to-advance offset for decentralized coordination.
    pub sta_offset: Interval,
    pub scheduler: SchedulerOptions,
}

impl FederateOptions {
    pub fn new(id: FederateId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            coordination: CoordinationMode::default(),
            grant_timeout: Duration::from_secs(5),
            grant_timeout_policy: GrantTimeoutPolicy::default(),
            sta_offset: 0,
            scheduler: SchedulerOptions::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerOptions) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_coordination(mut self, coordination: CoordinationMode) -> Self {
        self.coordination = coordination;
        self
    }

    pub fn with_grant_timeout(mut self, timeout: Duration) -> Self {
        self.grant_timeout = timeout;
        self
    }

    pub fn with_grant_timeout_policy(mut self, policy: GrantTimeoutPolicy) -> Self {
        self.grant_timeout_policy = policy;
        self
    }

    pub fn with_sta_offset(mut self, offset: Interval) -> Self {
        self.sta_offset = offset;
        self
    }
}

/// How physical actions bound the next event tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Horizon {
    /// Nothing outside the scheduler adds events.
    Closed,
    /// No physical action can be given a tag before this.
    Open(Tag),
    /// A physical action request waits to be absorbed.
    Pending,
}

/// One incoming federation connection, bound to a local input channel.
#[derive(Debug)]
struct InputBinding {
    connection: u32,
    upstream: FederateId,
    delay: Option<Interval>,
    slot: PortRef,
    /// Every message on this connection with a tag below this has arrived.
    known_before: Tag,
}

impl InputBinding {
    fn is_known(&self, tag: Tag) -> bool {
        self.known_before > tag
    }

    fn learn(&mut self, bound: Tag) {
        self.known_before = self.known_before.max(bound);
    }

    /// Bound implied by a message or absent notice arriving at `tag`.
    /// Through a positive delay several sender microsteps land on one
    /// arrival tag, so only earlier tags are settled.
    fn bound_after_arrival(&self, tag: Tag) -> Tag {
        match self.delay {
            Some(d) if d > 0 => tag,
            _ => tag.next_microstep(),
        }
    }
}

/// Network state of a federate; the scheduler sees it as [`NetworkHooks`].
struct FederateNet {
    id: FederateId,
    mode: CoordinationMode,
    grant_timeout: Duration,
    policy: GrantTimeoutPolicy,
    link: Link,
    inbound: mpsc::Receiver<Inbound>,
    inputs: Vec<InputBinding>,
    outputs: HashMap<PortRef, Vec<(u32, Option<Interval>)>>,
    last_granted: Tag,
    last_provisional: Tag,
    completed: Tag,
    processing: Option<Tag>,
    /// Values received for the tag being processed.
    arrived: Vec<Event>,
    /// Values received for later tags, handed to the scheduler between tags.
    deferred: Vec<Event>,
    /// Stop tag from the coordinator, not yet applied.
    pending_stop: Option<Tag>,
    /// Set while a stop negotiation is open: tags at or after it wait.
    stop_bound: Option<Tag>,
    stop_received: bool,
    last_net: Option<Tag>,
    stats: FederateStats,
}

impl FederateNet {
    fn new(options: &FederateOptions, link: Link, inbound: mpsc::Receiver<Inbound>) -> Self {
        Self {
            id: options.id,
            mode: options.coordination,
            grant_timeout: options.grant_timeout,
            policy: options.grant_timeout_policy,
            link,
            inbound,
            inputs: Vec::new(),
            outputs: HashMap::new(),
            last_granted: Tag::NEVER,
            last_provisional: Tag::NEVER,
            completed: Tag::NEVER,
            processing: None,
            arrived: Vec::new(),
            deferred: Vec::new(),
            pending_stop: None,
            stop_bound: None,
            stop_received: false,
            last_net: None,
            stats: FederateStats::default(),
        }
    }

    /// Binds the connection table to local ports.
    fn bind(
        &mut self,
        scheduler: &mut LocalScheduler,
        connections: Vec<ConnectionEntry>,
    ) -> RuntimeResult<()> {
        let mut remote_inputs = Vec::new();
        let mut remote_outputs = Vec::new();
        {
            let program = scheduler.program();
            let lookup = |name: &str, channel: usize, index: u32| -> Result<PortId, GraphError> {
                let port = program
                    .port_by_name(name)
                    .ok_or_else(|| GraphError::UnknownPort(name.to_string()))?;
                let width = program.ports()[port].width;
                if channel >= width {
                    return Err(GraphError::InvalidConnection {
                        connection: index as usize,
                        reason: format!("channel {channel} of {name} (width {width})"),
                    });
                }
                Ok(port)
            };

            for entry in connections {
                if entry.dst == self.id {
                    let port = lookup(&entry.dst_port, entry.dst_channel, entry.index)?;
                    self.inputs.push(InputBinding {
                        connection: entry.index,
                        upstream: entry.src,
                        delay: entry.delay,
                        slot: PortRef::new(port, entry.dst_channel),
                        known_before: Tag::NEVER,
                    });
                    remote_inputs.push(port);
                }
                if entry.src == self.id {
                    let port = lookup(&entry.src_port, entry.src_channel, entry.index)?;
                    self.outputs
                        .entry(PortRef::new(port, entry.src_channel))
                        .or_default()
                        .push((entry.index, entry.delay));
                    remote_outputs.push(port);
                }
            }
        }
        for port in remote_inputs {
            scheduler.mark_remote_input(port)?;
        }
        for port in remote_outputs {
            scheduler.mark_remote_output(port)?;
        }
        Ok(())
    }

    fn send(&mut self, message: Message) -> RuntimeResult<()> {
        self.link.send(&message)
    }

    fn send_net(&mut self, tag: Tag) -> RuntimeResult<()> {
        if self.last_net == Some(tag) {
            return Ok(());
        }
        self.last_net = Some(tag);
        self.stats.next_event_tags_sent += 1;
        debug!(federate = self.id, %tag, "NET");
        self.send(Message::NextEventTag {
            federate: self.id,
            tag,
        })
    }

    /// Handles one inbound message. Returns `false` if `timeout` passed
    /// first; `None` waits indefinitely.
    fn pump(&mut self, timeout: Option<Duration>) -> RuntimeResult<bool> {
        let inbound = match timeout {
            Some(timeout) => match self.inbound.recv_timeout(timeout) {
                Ok(inbound) => inbound,
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => return Err(self.lost("reader stopped")),
            },
            None => self
                .inbound
                .recv()
                .map_err(|_| self.lost("reader stopped"))?,
        };
        match inbound {
            Inbound::Message { message, .. } => {
                self.handle(message)?;
                Ok(true)
            }
            Inbound::Closed { reason, .. } => Err(self.lost(&reason)),
        }
    }

    fn lost(&self, reason: &str) -> RuntimeError {
        RuntimeError::TransportFailure {
            peer: self.link.peer().to_string(),
            reason: reason.to_string(),
        }
    }

    fn grant_timed_out(&mut self, tag: Tag, waited: Duration) -> RuntimeResult<()> {
        self.stats.grant_timeouts += 1;
        match self.policy {
            GrantTimeoutPolicy::Warn => {
                warn!(federate = self.id, %tag, ?waited, "still waiting for the coordinator");
                Ok(())
            }
            GrantTimeoutPolicy::Escalate => Err(RuntimeError::GrantTimeout { tag, waited }),
        }
    }

    fn is_granted(&self, tag: Tag) -> bool {
        tag <= self.last_granted || tag <= self.last_provisional
    }

    /// Whether something received means the next tag must be selected again.
    fn needs_reselect(&self, tag: Tag) -> bool {
        self.pending_stop.is_some() || self.deferred.iter().any(|e| e.tag < tag)
    }

    fn inputs_known(&self, tag: Tag) -> bool {
        self.inputs.iter().all(|b| b.is_known(tag))
    }

    fn port_known(&self, port: PortId, tag: Tag) -> bool {
        self.inputs
            .iter()
            .filter(|b| b.slot.port == port)
            .all(|b| b.is_known(tag))
    }

    fn handle(&mut self, message: Message) -> RuntimeResult<()> {
        match message {
            Message::Tagged {
                tag,
                connection,
                value,
                ..
            } => self.on_input(tag, connection, Some(value)),
            Message::PortAbsent {
                tag, connection, ..
            } => self.on_input(tag, connection, None),
            Message::Grant { tag } => {
                self.stats.grants_received += 1;
                self.last_granted = self.last_granted.max(tag);
                for binding in &mut self.inputs {
                    binding.learn(tag.next_microstep());
                }
                debug!(federate = self.id, %tag, "TAG received");
                Ok(())
            }
            Message::ProvisionalGrant { tag } => {
                self.stats.provisional_grants_received += 1;
                self.last_provisional = self.last_provisional.max(tag);
                debug!(federate = self.id, %tag, "PTAG received");
                Ok(())
            }
            Message::Ack { upstream, tag } => {
                for binding in self.inputs.iter_mut().filter(|b| b.upstream == upstream) {
                    let bound = tag.next_microstep().delayed(binding.delay);
                    binding.learn(bound);
                }
                Ok(())
            }
            Message::StopRequest { federate, tag } => {
                let floor = self.completed.next_microstep().max(Tag::ZERO);
                let reply = tag.max(floor);
                self.stop_bound = Some(self.stop_bound.map_or(reply, |b| b.min(reply)));
                info!(federate = self.id, requester = federate, stop = %reply, "stop requested");
                self.send(Message::StopReply {
                    federate: self.id,
                    tag: reply,
                })
            }
            Message::Stop { tag } => {
                self.pending_stop = Some(self.pending_stop.map_or(tag, |s| s.min(tag)));
                self.stop_bound = None;
                self.stop_received = true;
                info!(federate = self.id, stop = %tag, "stop received");
                Ok(())
            }
            Message::Abort { origin, reason } => Err(RuntimeError::Aborted { origin, reason }),
            other => Err(RuntimeError::Protocol(format!(
                "unexpected {:?} from the coordinator",
                other.kind()
            ))),
        }
    }

    fn on_input(&mut self, tag: Tag, connection: u32, value: Option<Value>) -> RuntimeResult<()> {
        let Some(index) = self.inputs.iter().position(|b| b.connection == connection) else {
            return Err(RuntimeError::Protocol(format!(
                "federate {} has no input on connection {connection}",
                self.id
            )));
        };

        let Some(value) = value else {
            if tag > self.completed {
                let bound = self.inputs[index].bound_after_arrival(tag);
                self.inputs[index].learn(bound);
            }
            return Ok(());
        };
        self.stats.messages_received += 1;

        let binding = &self.inputs[index];
        let tardy = tag <= self.completed
            || binding.is_known(tag)
            || self.processing.map_or(false, |p| {
                tag < p || (tag == p && self.mode == CoordinationMode::Decentralized)
            });
        if tardy {
            let current = self.processing.unwrap_or(self.completed);
            warn!(federate = self.id, %tag, %current, connection, "tardy message");
            return Err(RuntimeError::TimeOrderViolation {
                attempted: tag,
                current,
            });
        }

        let event = Event::port(tag, binding.slot, value);
        let bound = binding.bound_after_arrival(tag);
        if self.processing == Some(tag) {
            self.arrived.push(event);
        } else {
            self.deferred.push(event);
        }
        self.inputs[index].learn(bound);
        Ok(())
    }
}

impl NetworkHooks for FederateNet {
    fn unresolved_inputs(&mut self, tag: Tag) -> Vec<PortId> {
        // a provisional grant for a later tag settles everything before it
        if self.mode != CoordinationMode::Centralized
            || tag <= self.last_granted
            || tag < self.last_provisional
        {
            return Vec::new();
        }
        let mut ports: Vec<PortId> = self
            .inputs
            .iter()
            .filter(|b| !b.is_known(tag))
            .map(|b| b.slot.port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    fn resolve(&mut self, tag: Tag, ports: &[PortId]) -> RuntimeResult<Vec<Event>> {
        let mut since = std::time::Instant::now();
        while tag > self.last_granted && !ports.iter().all(|&p| self.port_known(p, tag)) {
            if !self.pump(Some(self.grant_timeout))? {
                self.grant_timed_out(tag, since.elapsed())?;
                since = std::time::Instant::now();
            }
        }
        Ok(std::mem::take(&mut self.arrived))
    }

    fn transmit(&mut self, tag: Tag, slot: PortRef, value: &Value) -> RuntimeResult<()> {
        let Some(targets) = self.outputs.get(&slot).cloned() else {
            return Ok(());
        };
        for (connection, delay) in targets {
            self.stats.messages_sent += 1;
            self.send(Message::Tagged {
                federate: self.id,
                tag: tag.delayed(delay),
                connection,
                value: value.clone(),
            })?;
        }
        Ok(())
    }

    fn announce_absent(&mut self, tag: Tag, slot: PortRef) -> RuntimeResult<()> {
        let Some(targets) = self.outputs.get(&slot).cloned() else {
            return Ok(());
        };
        for (connection, delay) in targets {
            self.stats.absent_sent += 1;
            self.send(Message::PortAbsent {
                federate: self.id,
                tag: tag.delayed(delay),
                connection,
            })?;
        }
        Ok(())
    }
}

/// A program running as one member of a federation.
pub struct Federate {
    id: FederateId,
    name: String,
    sta_offset: Interval,
    scheduler: LocalScheduler,
    net: FederateNet,
}

impl std::fmt::Debug for Federate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Federate")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Federate {
    /// Connects to the coordinator through `endpoint`, binds network ports
    /// and waits for the federation to start.
    pub fn join(program: Program, options: FederateOptions, endpoint: Endpoint) -> RuntimeResult<Self> {
        let (tx, rx) = mpsc::channel();
        let link = Link::open(0, "coordinator", endpoint, tx)?;
        let mut net = FederateNet::new(&options, link, rx);
        let mut scheduler = LocalScheduler::new(program, options.scheduler.clone());
        net.send(Message::Hello {
            federate: options.id,
        })?;

        let start_epoch = loop {
            let inbound = net.inbound.recv().map_err(|_| net.lost("reader stopped"))?;
            let message = match inbound {
                Inbound::Message { message, .. } => message,
                Inbound::Closed { reason, .. } => return Err(net.lost(&reason)),
            };
            match message {
                Message::Neighbors { connections, .. } => net.bind(&mut scheduler, connections)?,
                Message::Start { start_epoch } => break start_epoch,
                Message::Abort { origin, reason } => {
                    return Err(RuntimeError::Aborted { origin, reason })
                }
                other => {
                    return Err(RuntimeError::Protocol(format!(
                        "unexpected {:?} before start",
                        other.kind()
                    )))
                }
            }
        };
        scheduler.set_start_epoch(start_epoch);
        scheduler.initialize()?;
        info!(
            federate = options.id,
            name = %options.name,
            inputs = net.inputs.len(),
            outputs = net.outputs.len(),
            "joined federation"
        );

        Ok(Self {
            id: options.id,
            name: options.name,
            sta_offset: options.sta_offset,
            scheduler,
            net,
        })
    }

    pub fn id(&self) -> FederateId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> &LocalScheduler {
        &self.scheduler
    }

    pub fn physical_action(&self, action: ActionId) -> Result<PhysicalActionHandle, GraphError> {
        self.scheduler.physical_action(action)
    }

    /// Runs until shutdown, then resigns. On a local failure the coordinator
    /// is told so that downstream federates stop.
    pub fn run(mut self) -> RuntimeResult<RunReport> {
        let timer = Timer::start();
        let outcome = self.run_loop();
        match &outcome {
            Ok(()) => {
                info!(federate = self.id, tag = %self.scheduler.current_tag(), "resigning");
                self.net.send(Message::Resign { federate: self.id })?;
            }
            Err(err) if err.is_fatal_to_federation() => {
                error!(federate = self.id, %err, "federation lost");
            }
            Err(err) => {
                error!(federate = self.id, %err, "federate failed");
                let failed = Message::Failed {
                    federate: self.id,
                    reason: err.to_string(),
                };
                if let Err(send_err) = self.net.send(failed) {
                    debug!(federate = self.id, %send_err, "could not report failure");
                }
            }
        }
        outcome?;

        let mut report = self.scheduler.report(&self.name, timer.elapsed_ms());
        report.federate = Some(self.net.stats.clone());
        Ok(report)
    }

    fn run_loop(&mut self) -> RuntimeResult<()> {
        loop {
            if self.scheduler.is_shutdown() {
                return Ok(());
            }
            self.absorb()?;
            self.scheduler.set_state(SchedulerState::SelectTag);
            let Some(tag) = self.scheduler.next_tag() else {
                self.idle()?;
                continue;
            };

            if let Some(bound) = self.net.stop_bound.filter(|&bound| tag >= bound) {
                // a stop is being negotiated; go no further until it is known
                let poll = self.send_bounded_net(bound)?;
                self.net.pump(poll)?;
                continue;
            }
            if !self.await_safe(tag)? {
                continue;
            }
            self.absorb()?;
            if self.scheduler.next_tag() != Some(tag) {
                continue;
            }
            if !self.scheduler.wait_for_physical(tag) {
                continue;
            }

            self.net.processing = Some(tag);
            self.net.arrived.clear();
            let processed = self.scheduler.process_tag(tag, &mut self.net);
            self.net.processing = None;
            processed?;

            self.net.completed = tag;
            self.net.send(Message::LogicalTagComplete {
                federate: self.id,
                tag,
            })?;

            if let Some(stop) = self.scheduler.take_stop_request() {
                if !self.scheduler.is_shutdown()
                    && !self.net.stop_received
                    && self.net.stop_bound.is_none()
                {
                    info!(federate = self.id, stop = %stop, "requesting stop");
                    self.net.stop_bound = Some(stop);
                    self.net.send(Message::StopRequest {
                        federate: self.id,
                        tag: stop,
                    })?;
                }
            }
        }
    }

    /// Hands received values and stop tags to the scheduler.
    fn absorb(&mut self) -> RuntimeResult<()> {
        for event in std::mem::take(&mut self.net.deferred) {
            self.scheduler.schedule_external(event)?;
        }
        if let Some(stop) = self.net.pending_stop.take() {
            let floor = self.scheduler.current_tag().next_microstep().max(Tag::ZERO);
            self.scheduler.set_stop_tag(stop.max(floor))?;
        }
        Ok(())
    }

    fn idle(&mut self) -> RuntimeResult<()> {
        self.scheduler.set_state(SchedulerState::Idle);
        let next = self.net.stop_bound.unwrap_or(Tag::FOREVER);
        let poll = self.send_bounded_net(next)?;
        self.net.pump(poll)?;
        Ok(())
    }

    fn horizon(&self) -> Horizon {
        let program = self.scheduler.program();
        if !self.scheduler.options().keepalive && !program.has_physical_actions() {
            return Horizon::Closed;
        }
        match self.scheduler.physical_horizon() {
            Some(now) => {
                let min_delay = program.min_physical_delay().unwrap_or(0).max(0);
                Horizon::Open(Tag::at(now.max(0).saturating_add(min_delay)))
            }
            None => Horizon::Pending,
        }
    }

    /// Reports `next` as the next event tag, lowered to the physical
    /// horizon. A NET is a promise: nothing earlier is processed afterwards.
    /// Returns how long to wait for messages before the horizon must be
    /// looked at again.
    fn send_bounded_net(&mut self, next: Tag) -> RuntimeResult<Option<Duration>> {
        match self.horizon() {
            Horizon::Closed => {
                self.net.send_net(next)?;
                Ok(None)
            }
            Horizon::Open(bound) => {
                self.net.send_net(next.min(bound))?;
                Ok(Some(IDLE_POLL))
            }
            // the request may land below anything we could promise now
            Horizon::Pending => Ok(Some(Duration::ZERO)),
        }
    }

    /// Waits until `tag` is safe to process. Returns `false` when the next
    /// tag has to be selected again.
    fn await_safe(&mut self, tag: Tag) -> RuntimeResult<bool> {
        match self.net.mode {
            CoordinationMode::Centralized => {
                if self.net.is_granted(tag) {
                    return Ok(true);
                }
                self.scheduler.set_state(SchedulerState::WaitForGrant);
                self.net.stats.grant_waits += 1;
                let mut since = std::time::Instant::now();
                loop {
                    let poll = self.send_bounded_net(tag)?;
                    let wait = poll.map_or(self.net.grant_timeout, |p| p.min(self.net.grant_timeout));
                    if self.net.pump(Some(wait))? {
                        since = std::time::Instant::now();
                        if self.net.is_granted(tag) {
                            return Ok(true);
                        }
                        if self.net.needs_reselect(tag) {
                            return Ok(false);
                        }
                    } else if since.elapsed() >= self.net.grant_timeout {
                        self.net.grant_timed_out(tag, since.elapsed())?;
                        since = std::time::Instant::now();
                    }
                    // a physical action may have put an earlier tag first
                    if poll.is_some() && self.scheduler.next_tag() != Some(tag) {
                        return Ok(false);
                    }
                }
            }
            CoordinationMode::Decentralized => {
                self.send_bounded_net(tag)?;
                if self.net.inputs.is_empty() {
                    return Ok(true);
                }
                self.scheduler.set_state(SchedulerState::WaitForGrant);
                let deadline = if self.scheduler.options().fast {
                    self.scheduler
                        .physical_elapsed()
                        .saturating_add(self.sta_offset)
                } else {
                    tag.time.saturating_add(self.sta_offset)
                };
                loop {
                    if self.net.inputs_known(tag) {
                        return Ok(true);
                    }
                    let now = self.scheduler.physical_elapsed();
                    if now >= deadline {
                        debug!(federate = self.id, %tag, "safe-to-advance offset elapsed");
                        return Ok(true);
                    }
                    let remaining = Duration::from_nanos(u64::try_from(deadline - now).unwrap_or(0));
                    if self.net.pump(Some(remaining))? && self.net.needs_reselect(tag) {
                        return Ok(false);
                    }
                }
            }
        }
    }
}
