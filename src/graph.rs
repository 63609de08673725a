//! Program assembly and reaction ordering.
//!
//! A [`ProgramBuilder`] collects reactors, ports, timers, actions, reactions
//! and connections. [`ProgramBuilder::build`] validates the assembly and
//! assigns every reaction a *level*: a reaction's level is strictly greater
//! than the level of every reaction it depends on. Reactions of the same
//! level are independent and may run concurrently.
//!
//! A reaction depends on
//! - the previous reaction of the same reactor, and
//! - every reaction that may write a port it observes, directly or through
//!   a chain of same-tag connections.
//!
//! # Example
//!
//! ```
//! use kairos::graph::ProgramBuilder;
//! use kairos::reaction::{reactor_fn, ReactionOutcome, ReactionSpec};
//! use kairos::connection::ConnectionDesc;
//!
//! let mut b = ProgramBuilder::new();
//! let src = b.add_reactor("source");
//! let out = b.add_output(src, "out");
//! b.add_reaction(src, ReactionSpec::new().on_startup().writes(out));
//! b.set_body(src, reactor_fn(move |_, ctx| { ctx.set(out, 1); ReactionOutcome::Ok })).unwrap();
//!
//! let dst = b.add_reactor("sink");
//! let input = b.add_input(dst, "in");
//! b.add_reaction(dst, ReactionSpec::new().on_port(input));
//! b.set_body(dst, reactor_fn(|_, _| ReactionOutcome::Ok)).unwrap();
//!
//! b.connect(ConnectionDesc::new(out, input));
//! let program = b.build().unwrap();
//! assert_eq!(program.reactions()[1].level, 1);
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::{ConnectionDesc, ConnectionTable};
use crate::error::GraphError;
use crate::event::TriggerSource;
use crate::port::{PortDesc, PortKind};
use crate::reaction::{Effect, ReactionDesc, ReactionSpec, Reactor};
use crate::types::{ActionId, Interval, PortId, ReactionId, ReactorId, TimerId};

/// Static description of a reactor instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReactorDesc {
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Scheduled by reactions, relative to logical time.
    Logical,
    /// Scheduled from outside, relative to physical time.
    Physical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionDesc {
    pub name: String,
    pub reactor: ReactorId,
    pub kind: ActionKind,
    pub min_delay: Interval,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerDesc {
    pub name: String,
    pub reactor: ReactorId,
    pub offset: Interval,
    /// Zero for a timer that fires once.
    pub period: Interval,
}

/// Collects the parts of a program.
#[derive(Default)]
pub struct ProgramBuilder {
    reactors: Vec<ReactorDesc>,
    bodies: Vec<Option<Box<dyn Reactor>>>,
    ports: Vec<PortDesc>,
    actions: Vec<ActionDesc>,
    timers: Vec<TimerDesc>,
    reactions: Vec<ReactionDesc>,
    reactions_per_reactor: Vec<usize>,
    connections: Vec<ConnectionDesc>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a reactor. Its body is supplied with [`set_body`](Self::set_body)
    /// once its ports and actions exist.
    pub fn add_reactor(&mut self, name: impl Into<String>) -> ReactorId {
        self.reactors.push(ReactorDesc { name: name.into() });
        self.bodies.push(None);
        self.reactions_per_reactor.push(0);
        self.reactors.len() - 1
    }

    pub fn set_body(&mut self, reactor: ReactorId, body: Box<dyn Reactor>) -> Result<(), GraphError> {
        let slot = self.bodies.get_mut(reactor).ok_or(GraphError::UnknownId {
            kind: "reactor",
            id: reactor,
        })?;
        *slot = Some(body);
        Ok(())
    }

    fn add_port(&mut self, reactor: ReactorId, name: String, kind: PortKind, width: usize) -> PortId {
        self.ports.push(PortDesc {
            name,
            reactor,
            kind,
            width,
        });
        self.ports.len() - 1
    }

    pub fn add_input(&mut self, reactor: ReactorId, name: impl Into<String>) -> PortId {
        self.add_port(reactor, name.into(), PortKind::Input, 1)
    }

    pub fn add_multiport_input(
        &mut self,
        reactor: ReactorId,
        name: impl Into<String>,
        width: usize,
    ) -> PortId {
        self.add_port(reactor, name.into(), PortKind::Input, width)
    }

    pub fn add_output(&mut self, reactor: ReactorId, name: impl Into<String>) -> PortId {
        self.add_port(reactor, name.into(), PortKind::Output, 1)
    }

    pub fn add_multiport_output(
        &mut self,
        reactor: ReactorId,
        name: impl Into<String>,
        width: usize,
    ) -> PortId {
        self.add_port(reactor, name.into(), PortKind::Output, width)
    }

    /// Adds a timer firing at `offset` and then every `period` (zero: once).
    pub fn add_timer(
        &mut self,
        reactor: ReactorId,
        name: impl Into<String>,
        offset: Interval,
        period: Interval,
    ) -> TimerId {
        self.timers.push(TimerDesc {
            name: name.into(),
            reactor,
            offset,
            period,
        });
        self.timers.len() - 1
    }

    pub fn add_logical_action(
        &mut self,
        reactor: ReactorId,
        name: impl Into<String>,
        min_delay: Interval,
    ) -> ActionId {
        self.add_action(reactor, name.into(), ActionKind::Logical, min_delay)
    }

    pub fn add_physical_action(
        &mut self,
        reactor: ReactorId,
        name: impl Into<String>,
        min_delay: Interval,
    ) -> ActionId {
        self.add_action(reactor, name.into(), ActionKind::Physical, min_delay)
    }

    fn add_action(
        &mut self,
        reactor: ReactorId,
        name: String,
        kind: ActionKind,
        min_delay: Interval,
    ) -> ActionId {
        self.actions.push(ActionDesc {
            name,
            reactor,
            kind,
            min_delay,
        });
        self.actions.len() - 1
    }

    /// Adds the next reaction of `reactor`. Reactions of one reactor run in
    /// the order they are added.
    pub fn add_reaction(&mut self, reactor: ReactorId, spec: ReactionSpec) -> ReactionId {
        let index = match self.reactions_per_reactor.get_mut(reactor) {
            Some(count) => {
                *count += 1;
                *count - 1
            }
            None => 0,
        };
        self.reactions.push(ReactionDesc {
            reactor,
            index,
            triggers: spec.triggers,
            sources: spec.sources,
            effects: spec.effects,
            deadline: spec.deadline,
            level: 0,
        });
        self.reactions.len() - 1
    }

    /// Adds a connection; returns its index.
    pub fn connect(&mut self, connection: ConnectionDesc) -> usize {
        self.connections.push(connection);
        self.connections.len() - 1
    }

    /// Validates the assembly and computes reaction levels.
    pub fn build(self) -> Result<Program, GraphError> {
        let ProgramBuilder {
            reactors,
            bodies,
            ports,
            actions,
            timers,
            mut reactions,
            connections,
            ..
        } = self;

        let mut owned = Vec::with_capacity(bodies.len());
        for (id, body) in bodies.into_iter().enumerate() {
            owned.push(body.ok_or_else(|| GraphError::MissingBody(reactors[id].name.clone()))?);
        }
        validate_ids(&reactors, &ports, &actions, &timers, &reactions)?;

        let widths = |p: PortId| ports.get(p).map(|d| d.width);
        let mut table = ConnectionTable::new();
        for (index, conn) in connections.iter().enumerate() {
            for edge in conn.expand(index, &widths)? {
                table.add(edge);
            }
        }

        let reach = instantaneous_reach(&ports, &table)?;
        let observers = observers_by_port(ports.len(), &reactions);
        let levels = assign_levels(&reactors, &reactions, &reach, &observers)?;
        for (reaction, level) in reactions.iter_mut().zip(&levels) {
            reaction.level = *level;
        }

        let mut triggered: BTreeMap<TriggerSource, Vec<ReactionId>> = BTreeMap::new();
        for (id, reaction) in reactions.iter().enumerate() {
            for trigger in &reaction.triggers {
                triggered.entry(*trigger).or_default().push(id);
            }
        }

        let mut writers = vec![Vec::new(); ports.len()];
        for (id, reaction) in reactions.iter().enumerate() {
            for written in reaction.written_ports() {
                for &port in &reach[written] {
                    if !writers[port].contains(&id) {
                        writers[port].push(id);
                    }
                }
            }
        }

        let mut dependents_level = vec![None; ports.len()];
        for (port, reached) in reach.iter().enumerate() {
            dependents_level[port] = reached
                .iter()
                .flat_map(|&q| observers[q].iter())
                .map(|&r| levels[r])
                .min();
        }

        let input_deps = input_dependencies(&ports, &reactions, &reach, &observers);
        let level_count = levels.iter().max().map_or(0, |m| m + 1);
        debug!(
            reactors = reactors.len(),
            reactions = reactions.len(),
            edges = table.len(),
            levels = level_count,
            "program built"
        );

        Ok(Program {
            reactors,
            bodies: owned,
            ports,
            actions,
            timers,
            reactions,
            connections: table,
            triggered,
            writers,
            dependents_level,
            input_deps,
            level_count,
        })
    }
}

fn validate_ids(
    reactors: &[ReactorDesc],
    ports: &[PortDesc],
    actions: &[ActionDesc],
    timers: &[TimerDesc],
    reactions: &[ReactionDesc],
) -> Result<(), GraphError> {
    let check = |kind: &'static str, id: usize, len: usize| {
        if id < len {
            Ok(())
        } else {
            Err(GraphError::UnknownId { kind, id })
        }
    };
    for p in ports {
        check("reactor", p.reactor, reactors.len())?;
    }
    for a in actions {
        check("reactor", a.reactor, reactors.len())?;
    }
    for t in timers {
        check("reactor", t.reactor, reactors.len())?;
    }
    for r in reactions {
        check("reactor", r.reactor, reactors.len())?;
        for trigger in &r.triggers {
            match *trigger {
                TriggerSource::Timer(t) => check("timer", t, timers.len())?,
                TriggerSource::Action(a) => check("action", a, actions.len())?,
                TriggerSource::Port(p) => check("port", p, ports.len())?,
                TriggerSource::Startup | TriggerSource::Shutdown => {}
            }
        }
        for &p in &r.sources {
            check("port", p, ports.len())?;
        }
        for effect in &r.effects {
            match *effect {
                Effect::Port(p) => check("port", p, ports.len())?,
                Effect::Action(a) => check("action", a, actions.len())?,
            }
        }
    }
    Ok(())
}

/// For every port, the ports (itself included) that see its value at the
/// same tag. Fails on a same-tag connection cycle.
fn instantaneous_reach(
    ports: &[PortDesc],
    table: &ConnectionTable,
) -> Result<Vec<BTreeSet<PortId>>, GraphError> {
    let mut adj: Vec<BTreeSet<PortId>> = vec![BTreeSet::new(); ports.len()];
    for edge in table.all().iter().filter(|e| e.is_instantaneous()) {
        adj[edge.src.port].insert(edge.dst.port);
    }

    let mut reach = Vec::with_capacity(ports.len());
    for start in 0..ports.len() {
        let mut seen = BTreeSet::from([start]);
        let mut stack: Vec<PortId> = adj[start].iter().copied().collect();
        while let Some(port) = stack.pop() {
            if port == start {
                return Err(GraphError::CausalityCycle(vec![ports[start].name.clone()]));
            }
            if seen.insert(port) {
                stack.extend(adj[port].iter().copied());
            }
        }
        reach.push(seen);
    }
    Ok(reach)
}

fn observers_by_port(port_count: usize, reactions: &[ReactionDesc]) -> Vec<Vec<ReactionId>> {
    let mut observers = vec![Vec::new(); port_count];
    for (id, reaction) in reactions.iter().enumerate() {
        for port in reaction.observed_ports() {
            if !observers[port].contains(&id) {
                observers[port].push(id);
            }
        }
    }
    observers
}

/// Longest-path levels by Kahn's algorithm.
fn assign_levels(
    reactors: &[ReactorDesc],
    reactions: &[ReactionDesc],
    reach: &[BTreeSet<PortId>],
    observers: &[Vec<ReactionId>],
) -> Result<Vec<usize>, GraphError> {
    let n = reactions.len();
    let mut adj: Vec<BTreeSet<ReactionId>> = vec![BTreeSet::new(); n];

    // same reactor: declaration order
    let mut last_of_reactor: Vec<Option<ReactionId>> = vec![None; reactors.len()];
    for (id, reaction) in reactions.iter().enumerate() {
        if let Some(prev) = last_of_reactor[reaction.reactor] {
            adj[prev].insert(id);
        }
        last_of_reactor[reaction.reactor] = Some(id);
    }

    // writer -> observer through same-tag paths
    for (id, reaction) in reactions.iter().enumerate() {
        for written in reaction.written_ports() {
            for &port in &reach[written] {
                for &observer in &observers[port] {
                    adj[id].insert(observer);
                }
            }
        }
    }

    let mut in_degree = vec![0usize; n];
    for targets in &adj {
        for &t in targets {
            in_degree[t] += 1;
        }
    }

    let mut queue: VecDeque<ReactionId> = (0..n).filter(|&r| in_degree[r] == 0).collect();
    let mut levels = vec![0usize; n];
    let mut visited = 0;
    while let Some(r) = queue.pop_front() {
        visited += 1;
        for &next in &adj[r] {
            levels[next] = levels[next].max(levels[r] + 1);
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited != n {
        let stuck = (0..n)
            .filter(|&r| in_degree[r] > 0)
            .map(|r| {
                format!(
                    "{}[{}]",
                    reactors[reactions[r].reactor].name, reactions[r].index
                )
            })
            .collect();
        return Err(GraphError::CausalityCycle(stuck));
    }
    Ok(levels)
}

/// For every reaction, the input ports whose status at a tag it may depend
/// on, through observation or through an upstream reaction.
fn input_dependencies(
    ports: &[PortDesc],
    reactions: &[ReactionDesc],
    reach: &[BTreeSet<PortId>],
    observers: &[Vec<ReactionId>],
) -> Vec<BTreeSet<PortId>> {
    let mut feeders: Vec<BTreeSet<PortId>> = vec![BTreeSet::new(); ports.len()];
    for (from, reached) in reach.iter().enumerate() {
        if ports[from].kind == PortKind::Input {
            for &q in reached {
                feeders[q].insert(from);
            }
        }
    }

    let mut order: Vec<ReactionId> = (0..reactions.len()).collect();
    order.sort_by_key(|&r| (reactions[r].level, r));

    let mut deps: Vec<BTreeSet<PortId>> = vec![BTreeSet::new(); reactions.len()];
    for &r in &order {
        let mut set: BTreeSet<PortId> = BTreeSet::new();
        for port in reactions[r].observed_ports() {
            set.extend(feeders[port].iter().copied());
        }
        deps[r].extend(set);
        // push this reaction's dependencies to everything downstream of it
        let own = deps[r].clone();
        for written in reactions[r].written_ports() {
            for &port in &reach[written] {
                for &observer in &observers[port] {
                    deps[observer].extend(own.iter().copied());
                }
            }
        }
        if let Some(next) = reactions
            .iter()
            .enumerate()
            .skip(r + 1)
            .find(|(_, other)| other.reactor == reactions[r].reactor)
            .map(|(id, _)| id)
        {
            deps[next].extend(own);
        }
    }
    deps
}

/// A validated, levelled program ready to run.
pub struct Program {
    pub(crate) reactors: Vec<ReactorDesc>,
    pub(crate) bodies: Vec<Box<dyn Reactor>>,
    pub(crate) ports: Vec<PortDesc>,
    pub(crate) actions: Vec<ActionDesc>,
    pub(crate) timers: Vec<TimerDesc>,
    pub(crate) reactions: Vec<ReactionDesc>,
    pub(crate) connections: ConnectionTable,
    triggered: BTreeMap<TriggerSource, Vec<ReactionId>>,
    writers: Vec<Vec<ReactionId>>,
    dependents_level: Vec<Option<usize>>,
    input_deps: Vec<BTreeSet<PortId>>,
    level_count: usize,
}

impl Program {
    pub fn reactors(&self) -> &[ReactorDesc] {
        &self.reactors
    }

    pub fn ports(&self) -> &[PortDesc] {
        &self.ports
    }

    pub fn actions(&self) -> &[ActionDesc] {
        &self.actions
    }

    pub fn timers(&self) -> &[TimerDesc] {
        &self.timers
    }

    pub fn reactions(&self) -> &[ReactionDesc] {
        &self.reactions
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Number of distinct levels.
    pub fn level_count(&self) -> usize {
        self.level_count
    }

    /// Looks up a port by `"reactor.port"`.
    pub fn port_by_name(&self, qualified: &str) -> Option<PortId> {
        let (reactor, port) = qualified.split_once('.')?;
        self.ports.iter().position(|p| {
            p.name == port
                && self
                    .reactors
                    .get(p.reactor)
                    .map_or(false, |r| r.name == reactor)
        })
    }

    /// `"reactor.port"` for a port id.
    pub fn port_name(&self, port: PortId) -> String {
        match self.ports.get(port) {
            Some(p) => format!("{}.{}", self.reactor_name(p.reactor), p.name),
            None => format!("port{port}"),
        }
    }

    pub fn reactor_name(&self, reactor: ReactorId) -> &str {
        self.reactors
            .get(reactor)
            .map_or("<unknown>", |r| r.name.as_str())
    }

    /// `"reactor[index]"` for a reaction id.
    pub fn reaction_name(&self, reaction: ReactionId) -> String {
        match self.reactions.get(reaction) {
            Some(r) => format!("{}[{}]", self.reactor_name(r.reactor), r.index),
            None => format!("reaction{reaction}"),
        }
    }

    /// Reactions declaring `source` as a trigger, in id order.
    pub fn triggered_by(&self, source: TriggerSource) -> &[ReactionId] {
        self.triggered.get(&source).map_or(&[], Vec::as_slice)
    }

    /// Reactions that may set `port` at a tag.
    pub fn writers(&self, port: PortId) -> &[ReactionId] {
        self.writers.get(port).map_or(&[], Vec::as_slice)
    }

    /// Lowest level of any reaction that observes `port`, or `None` when
    /// nothing observes it.
    pub fn dependents_level(&self, port: PortId) -> Option<usize> {
        self.dependents_level.get(port).copied().flatten()
    }

    /// Whether `reaction` may depend on the status of input `port`.
    pub fn depends_on_input(&self, reaction: ReactionId, port: PortId) -> bool {
        self.input_deps
            .get(reaction)
            .map_or(false, |deps| deps.contains(&port))
    }

    pub fn has_physical_actions(&self) -> bool {
        self.actions.iter().any(|a| a.kind == ActionKind::Physical)
    }

    /// Smallest minimum delay over the physical actions.
    pub fn min_physical_delay(&self) -> Option<Interval> {
        self.actions
            .iter()
            .filter(|a| a.kind == ActionKind::Physical)
            .map(|a| a.min_delay)
            .min()
    }
}
