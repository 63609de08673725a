//! The federation coordinator.
//!
//! The coordinator is a single-threaded message handler. Each federate link
//! has a reader thread feeding one inbound channel; every state change
//! happens in [`Coordinator::run`] as a reaction to one inbound message.
//!
//! # Time advance
//!
//! For every federate the coordinator tracks the next event tag it reported
//! (NET), the last tag it completed (LTC), the routed messages still in
//! flight towards it, and the grants it was given. From these it computes
//! the earliest tag at which each federate may still send anything:
//!
//! ```text
//! out(j) = max(ltc(j)+, min(next(j), min over upstream k of out(k) delayed by d(k,j)))
//! ```
//!
//! relaxed to a fixpoint over the federation graph. A federate whose next
//! tag is strictly earlier than anything that can still reach it receives
//! TAG; if the earliest arrival equals its next tag and it sits on a
//! zero-delay cycle, it receives PTAG and resolves its network inputs one by
//! one while processing.
//!
//! PTAG is only ever issued on a zero-delay cycle. Elsewhere an arrival equal
//! to the next tag withholds the grant: the upstream must complete that tag
//! first, which moves the arrival past it, and TAG follows from the LTC.
//! Without a cycle that always happens, so no federate waits for good.
//!
//! A routed message at or before the destination's last TAG means a NET
//! promise was broken. The federation is aborted rather than letting the
//! destination see a message from its past.

use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::sync::mpsc;

use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::{CoordinationMode, ConfigResult, RuntimeConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::federated::message::Message;
use crate::federated::topology::Topology;
use crate::federated::transport::{Endpoint, Inbound, Link};
use crate::stats::{CoordinatorReport, CoordinatorStats, Timer};
use crate::tag::Tag;
use crate::types::{epoch_nanos, FederateId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    /// Connected or expected, START not sent yet.
    Pending,
    Active,
    Resigned,
    Failed,
}

#[derive(Debug)]
struct Record {
    link: Option<usize>,
    status: Status,
    next_event: Tag,
    completed: Tag,
    /// Routed messages not yet covered by an LTC, by tag.
    in_flight: BTreeMap<Tag, usize>,
    last_granted: Tag,
    last_provisional: Tag,
}

impl Record {
    fn new() -> Self {
        Self {
            link: None,
            status: Status::Pending,
            next_event: Tag::NEVER,
            completed: Tag::NEVER,
            in_flight: BTreeMap::new(),
            last_granted: Tag::NEVER,
            last_provisional: Tag::NEVER,
        }
    }

    fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    fn effective_next(&self) -> Tag {
        let first_in_flight = self.in_flight.keys().next().copied().unwrap_or(Tag::FOREVER);
        self.next_event.min(first_in_flight)
    }

    /// Earliest tag the federate has not completed.
    fn earliest_open(&self) -> Tag {
        if self.completed.is_never() {
            Tag::ZERO
        } else {
            self.completed.next_microstep()
        }
    }

    fn retire(&mut self, status: Status) {
        self.status = status;
        self.next_event = Tag::FOREVER;
        self.in_flight.clear();
    }
}

struct Negotiation {
    proposed: Tag,
    awaiting: BTreeSet<FederateId>,
}

/// Runs the centralized side of a federation.
pub struct Coordinator {
    topology: Topology,
    mode: CoordinationMode,
    records: BTreeMap<FederateId, Record>,
    links: Vec<Link>,
    link_owner: BTreeMap<usize, FederateId>,
    started: bool,
    stop: Option<Tag>,
    negotiation: Option<Negotiation>,
    stats: CoordinatorStats,
}

impl Coordinator {
    pub fn new(topology: Topology, mode: CoordinationMode) -> Self {
        let records = topology
            .federates()
            .iter()
            .map(|&id| (id, Record::new()))
            .collect();
        Self {
            topology,
            mode,
            records,
            links: Vec::new(),
            link_owner: BTreeMap::new(),
            started: false,
            stop: None,
            negotiation: None,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::new(
            Topology::from_config(config),
            config.federation.coordination,
        ))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Accepts one TCP connection per federate, then runs.
    pub fn serve(self, listener: &TcpListener) -> RuntimeResult<CoordinatorReport> {
        let expected = self.records.len();
        let mut endpoints = Vec::with_capacity(expected);
        while endpoints.len() < expected {
            let (stream, addr) = listener.accept()?;
            info!(%addr, connected = endpoints.len() + 1, expected, "federate connected");
            endpoints.push(Endpoint::tcp(stream)?);
        }
        self.run(endpoints)
    }

    /// Runs the federation over `endpoints`, one per federate, until every
    /// federate has resigned or failed.
    pub fn run(mut self, endpoints: Vec<Endpoint>) -> RuntimeResult<CoordinatorReport> {
        let timer = Timer::start();
        let (tx, rx) = mpsc::channel();
        for (id, endpoint) in endpoints.into_iter().enumerate() {
            let link = Link::open(id, format!("link{id}"), endpoint, tx.clone())?;
            self.links.push(link);
        }
        drop(tx);
        if self.records.is_empty() {
            self.started = true;
        }
        info!(
            federates = self.records.len(),
            connections = self.topology.entries().len(),
            mode = ?self.mode,
            "coordinator running"
        );

        while !self.finished() {
            let inbound = rx
                .recv()
                .map_err(|_| RuntimeError::Protocol("every link reader stopped".into()))?;
            let result = match inbound {
                Inbound::Message { link, message } => self.handle(link, message),
                Inbound::Closed { link, reason } => self.on_closed(link, reason),
            };
            if let Err(err) = result {
                if !matches!(err, RuntimeError::TransportFailure { .. }) {
                    error!(%err, "coordinator failed");
                    self.abort_all(0, &err.to_string());
                }
                return Err(err);
            }
        }

        info!(stop = ?self.stop, "federation finished");
        Ok(CoordinatorReport {
            wall_time_ms: timer.elapsed_ms(),
            stats: self.stats.clone(),
            completed: self
                .records
                .iter()
                .map(|(&id, r)| (id, r.completed))
                .collect(),
            stop_tag: self.stop,
        })
    }

    fn finished(&self) -> bool {
        self.started
            && self
                .records
                .values()
                .all(|r| matches!(r.status, Status::Resigned | Status::Failed))
    }

    fn handle(&mut self, link: usize, message: Message) -> RuntimeResult<()> {
        match message {
            Message::Hello { federate } => self.on_hello(link, federate),
            Message::NextEventTag { federate, tag } => {
                let record = self.sender(link, federate)?;
                record.next_event = tag;
                debug!(federate, %tag, "next event tag");
                self.evaluate()?;
                self.check_quiescence()
            }
            Message::LogicalTagComplete { federate, tag } => self.on_complete(link, federate, tag),
            Message::Tagged {
                federate,
                tag,
                connection,
                value,
            } => self.route(link, federate, tag, connection, Some(value)),
            Message::PortAbsent {
                federate,
                tag,
                connection,
            } => self.route(link, federate, tag, connection, None),
            Message::StopRequest { federate, tag } => self.on_stop_request(link, federate, tag),
            Message::StopReply { federate, tag } => {
                self.sender(link, federate)?;
                if let Some(negotiation) = self.negotiation.as_mut() {
                    negotiation.proposed = negotiation.proposed.max(tag);
                    negotiation.awaiting.remove(&federate);
                }
                self.finish_negotiation()
            }
            Message::Resign { federate } => {
                self.sender(link, federate)?.retire(Status::Resigned);
                self.stats.resigned += 1;
                info!(federate, "federate resigned");
                self.forget(federate)
            }
            Message::Failed { federate, reason } => self.on_failed(link, federate, reason),
            other => Err(RuntimeError::Protocol(format!(
                "unexpected {:?} from link {link}",
                other.kind()
            ))),
        }
    }

    /// Record of `federate`, checking that it speaks on its own link.
    fn sender(&mut self, link: usize, federate: FederateId) -> RuntimeResult<&mut Record> {
        if self.link_owner.get(&link) != Some(&federate) {
            return Err(RuntimeError::Protocol(format!(
                "link {link} speaks for federate {federate} without a HELLO"
            )));
        }
        self.records
            .get_mut(&federate)
            .ok_or_else(|| RuntimeError::Protocol(format!("unknown federate {federate}")))
    }

    fn send_to(&mut self, federate: FederateId, message: &Message) -> RuntimeResult<()> {
        let Some(record) = self.records.get(&federate) else {
            return Ok(());
        };
        let Some(link) = record.link.and_then(|l| self.links.get_mut(l)) else {
            return Ok(());
        };
        match link.send(message) {
            Ok(()) => Ok(()),
            Err(err) if !matches!(record.status, Status::Active | Status::Pending) => {
                debug!(federate, %err, "send to departed federate dropped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn active(&self) -> Vec<FederateId> {
        self.records
            .iter()
            .filter(|(_, r)| r.is_active())
            .map(|(&id, _)| id)
            .collect()
    }

    fn on_hello(&mut self, link: usize, federate: FederateId) -> RuntimeResult<()> {
        let record = self.records.get_mut(&federate).ok_or_else(|| {
            RuntimeError::Protocol(format!("federate {federate} is not part of this federation"))
        })?;
        if record.link.is_some() || self.link_owner.contains_key(&link) {
            return Err(RuntimeError::Protocol(format!(
                "federate {federate} joined twice"
            )));
        }
        record.link = Some(link);
        self.link_owner.insert(link, federate);
        info!(federate, link, "federate joined");

        let connections = self.topology.entries_for(federate);
        self.send_to(
            federate,
            &Message::Neighbors {
                federate,
                connections,
            },
        )?;

        if self.records.values().all(|r| r.link.is_some()) {
            self.start()?;
        }
        Ok(())
    }

    fn start(&mut self) -> RuntimeResult<()> {
        let start_epoch = epoch_nanos();
        for record in self.records.values_mut() {
            record.status = Status::Active;
            record.next_event = Tag::ZERO;
        }
        self.started = true;
        for id in self.active() {
            self.send_to(id, &Message::Start { start_epoch })?;
        }
        info!(start_epoch, "federation started");
        self.evaluate()
    }

    fn on_complete(&mut self, link: usize, federate: FederateId, tag: Tag) -> RuntimeResult<()> {
        let record = self.sender(link, federate)?;
        record.completed = record.completed.max(tag);
        record.in_flight = record.in_flight.split_off(&tag.next_microstep());
        debug!(federate, %tag, "tag complete");

        for downstream in self.topology.downstream(federate) {
            if self.records.get(&downstream).map_or(false, Record::is_active) {
                self.send_to(
                    downstream,
                    &Message::Ack {
                        upstream: federate,
                        tag,
                    },
                )?;
                self.stats.acks_sent += 1;
            }
        }
        self.evaluate()?;
        self.check_quiescence()
    }

    fn route(
        &mut self,
        link: usize,
        federate: FederateId,
        tag: Tag,
        connection: u32,
        value: Option<Value>,
    ) -> RuntimeResult<()> {
        self.sender(link, federate)?;
        let dst = match self.topology.entry(connection) {
            Some(entry) if entry.src == federate => entry.dst,
            _ => {
                return Err(RuntimeError::Protocol(format!(
                    "federate {federate} sent on connection {connection} it does not own"
                )))
            }
        };
        let Some(record) = self.records.get_mut(&dst).filter(|r| r.is_active()) else {
            debug!(dst, connection, "destination departed, message dropped");
            return Ok(());
        };

        match value {
            Some(value) => {
                if tag <= record.last_granted {
                    // the destination may already have passed `tag`
                    error!(dst, %tag, granted = %record.last_granted, "message behind grant");
                    return Err(RuntimeError::TimeOrderViolation {
                        attempted: tag,
                        current: record.last_granted,
                    });
                }
                *record.in_flight.entry(tag).or_default() += 1;
                self.stats.messages_routed += 1;
                self.send_to(
                    dst,
                    &Message::Tagged {
                        federate,
                        tag,
                        connection,
                        value,
                    },
                )?;
                self.evaluate()
            }
            None => {
                self.stats.absent_routed += 1;
                self.send_to(
                    dst,
                    &Message::PortAbsent {
                        federate,
                        tag,
                        connection,
                    },
                )
            }
        }
    }

    fn on_stop_request(&mut self, link: usize, federate: FederateId, tag: Tag) -> RuntimeResult<()> {
        self.sender(link, federate)?;
        if self.stop.is_some() {
            return Ok(());
        }
        if let Some(negotiation) = self.negotiation.as_mut() {
            negotiation.proposed = negotiation.proposed.max(tag);
            return Ok(());
        }

        self.stats.stop_negotiations += 1;
        let awaiting: BTreeSet<FederateId> =
            self.active().into_iter().filter(|&id| id != federate).collect();
        info!(federate, %tag, waiting_on = awaiting.len(), "stop requested");
        // nobody runs past the stop tag, which is at least each reply
        for record in self.records.values_mut().filter(|r| r.is_active()) {
            let floor = tag.max(record.earliest_open());
            record.next_event = record.next_event.min(floor);
        }
        for &id in &awaiting {
            self.send_to(id, &Message::StopRequest { federate, tag })?;
        }
        self.negotiation = Some(Negotiation {
            proposed: tag,
            awaiting,
        });
        self.finish_negotiation()
    }

    fn finish_negotiation(&mut self) -> RuntimeResult<()> {
        match &self.negotiation {
            Some(n) if n.awaiting.is_empty() => {
                let proposed = n.proposed;
                self.negotiation = None;
                self.issue_stop(proposed)
            }
            _ => Ok(()),
        }
    }

    fn issue_stop(&mut self, tag: Tag) -> RuntimeResult<()> {
        if self.stop.is_some() {
            return Ok(());
        }
        self.stop = Some(tag);
        info!(stop = %tag, "stopping federation");
        // everyone still runs shutdown reactions at the stop tag
        for record in self.records.values_mut().filter(|r| r.is_active()) {
            record.next_event = record.next_event.min(tag);
        }
        for id in self.active() {
            self.send_to(id, &Message::Stop { tag })?;
        }
        Ok(())
    }

    fn on_failed(&mut self, link: usize, federate: FederateId, reason: String) -> RuntimeResult<()> {
        self.sender(link, federate)?.retire(Status::Failed);
        self.stats.failed += 1;
        error!(federate, %reason, "federate failed");

        for downstream in self.topology.transitive_downstream(federate) {
            let Some(record) = self.records.get_mut(&downstream).filter(|r| r.is_active()) else {
                continue;
            };
            let tag = record.earliest_open();
            record.next_event = record.next_event.min(tag);
            info!(federate = downstream, stop = %tag, "stopping downstream of failed federate");
            self.send_to(downstream, &Message::Stop { tag })?;
        }
        self.forget(federate)
    }

    /// Drops a departed federate from any pending negotiation and
    /// re-evaluates everyone else.
    fn forget(&mut self, federate: FederateId) -> RuntimeResult<()> {
        if let Some(negotiation) = self.negotiation.as_mut() {
            negotiation.awaiting.remove(&federate);
        }
        self.finish_negotiation()?;
        self.evaluate()?;
        self.check_quiescence()
    }

    fn on_closed(&mut self, link: usize, reason: String) -> RuntimeResult<()> {
        let owner = self.link_owner.get(&link).copied();
        let departed = owner
            .and_then(|id| self.records.get(&id))
            .map_or(false, |r| matches!(r.status, Status::Resigned | Status::Failed));
        if departed {
            debug!(link, "link closed after resign");
            return Ok(());
        }

        let origin = owner.unwrap_or(0);
        error!(link, federate = ?owner, %reason, "link lost, aborting federation");
        self.abort_all(origin, &reason);
        Err(RuntimeError::TransportFailure {
            peer: match owner {
                Some(id) => format!("federate {id}"),
                None => format!("link {link}"),
            },
            reason,
        })
    }

    fn abort_all(&mut self, origin: FederateId, reason: &str) {
        let message = Message::Abort {
            origin,
            reason: reason.to_string(),
        };
        let targets: Vec<FederateId> = self
            .records
            .iter()
            .filter(|(_, r)| matches!(r.status, Status::Active | Status::Pending))
            .map(|(&id, _)| id)
            .collect();
        for id in targets {
            if let Err(err) = self.send_to(id, &message) {
                debug!(federate = id, %err, "abort not delivered");
            }
        }
    }

    /// Earliest tag at which each federate may still send, relaxed to a
    /// fixpoint.
    fn earliest_outputs(&self) -> BTreeMap<FederateId, Tag> {
        let mut out: BTreeMap<FederateId, Tag> = self
            .records
            .iter()
            .map(|(&id, r)| {
                let bound = if r.is_active() {
                    r.effective_next().max(r.earliest_open())
                } else {
                    Tag::FOREVER
                };
                (id, bound)
            })
            .collect();

        for _ in 0..=self.records.len() {
            let mut changed = false;
            for (&id, record) in &self.records {
                if !record.is_active() {
                    continue;
                }
                let mut bound = record.effective_next();
                for &(src, delay) in self.topology.upstream(id) {
                    let upstream = out.get(&src).copied().unwrap_or(Tag::FOREVER);
                    bound = bound.min(upstream.delayed(delay));
                }
                let bound = bound.max(record.earliest_open());
                if out.get(&id).map_or(true, |&current| bound < current) {
                    out.insert(id, bound);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        out
    }

    /// Issues every grant that has become safe.
    fn evaluate(&mut self) -> RuntimeResult<()> {
        if !self.started || self.mode == CoordinationMode::Decentralized {
            return Ok(());
        }
        let out = self.earliest_outputs();
        let mut grants = Vec::new();

        for (&id, record) in self.records.iter_mut() {
            if !record.is_active() {
                continue;
            }
            let next = record.effective_next();
            if next.is_forever() {
                continue;
            }
            let arrival = self
                .topology
                .upstream(id)
                .iter()
                .map(|&(src, delay)| out.get(&src).copied().unwrap_or(Tag::FOREVER).delayed(delay))
                .min()
                .unwrap_or(Tag::FOREVER);

            if arrival > next {
                if next > record.last_granted {
                    record.last_granted = next;
                    grants.push((id, Message::Grant { tag: next }));
                }
            } else if arrival == next
                && next > record.last_granted
                && next > record.last_provisional
                && self.topology.in_zero_delay_cycle(id)
            {
                record.last_provisional = next;
                grants.push((id, Message::ProvisionalGrant { tag: next }));
            }
        }

        for (id, grant) in grants {
            match &grant {
                Message::Grant { tag } => {
                    self.stats.grants_issued += 1;
                    debug!(federate = id, %tag, "TAG");
                }
                Message::ProvisionalGrant { tag } => {
                    self.stats.provisional_grants_issued += 1;
                    debug!(federate = id, %tag, "PTAG");
                }
                _ => {}
            }
            self.send_to(id, &grant)?;
        }
        Ok(())
    }

    /// Stops the federation once no federate has anything left to do.
    fn check_quiescence(&mut self) -> RuntimeResult<()> {
        if !self.started || self.stop.is_some() || self.negotiation.is_some() {
            return Ok(());
        }
        let active: Vec<&Record> = self.records.values().filter(|r| r.is_active()).collect();
        if active.is_empty() || active.iter().any(|r| !r.effective_next().is_forever()) {
            return Ok(());
        }
        let stop = active
            .iter()
            .map(|r| r.earliest_open())
            .max()
            .unwrap_or(Tag::ZERO);
        info!(stop = %stop, "federation quiescent");
        self.issue_stop(stop)
    }
}
