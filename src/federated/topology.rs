//! Federation graph: which federate feeds which, and with what delay.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::types::{FederateId, Interval};

/// One federate-to-federate connection between single channels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    /// Position in the federation's connection list; used on the wire.
    pub index: u32,
    pub src: FederateId,
    /// `"reactor.port"` inside the source federate.
    pub src_port: String,
    pub src_channel: usize,
    pub dst: FederateId,
    pub dst_port: String,
    pub dst_channel: usize,
    pub delay: Option<Interval>,
}

#[derive(Clone, Debug, Default)]
pub struct Topology {
    federates: Vec<FederateId>,
    entries: Vec<ConnectionEntry>,
    /// dst -> (src, delay) for every connection, deduplicated
    upstream: BTreeMap<FederateId, Vec<(FederateId, Option<Interval>)>>,
}

impl Topology {
    pub fn new(federates: Vec<FederateId>, entries: Vec<ConnectionEntry>) -> Self {
        let mut upstream: BTreeMap<FederateId, Vec<(FederateId, Option<Interval>)>> =
            BTreeMap::new();
        for entry in &entries {
            let list = upstream.entry(entry.dst).or_default();
            if !list.contains(&(entry.src, entry.delay)) {
                list.push((entry.src, entry.delay));
            }
        }
        Self {
            federates,
            entries,
            upstream,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        let federates = config.federates.iter().map(|f| f.id).collect();
        let entries = config
            .connections
            .iter()
            .enumerate()
            .map(|(index, c)| ConnectionEntry {
                index: index as u32,
                src: c.src,
                src_port: c.src_port.clone(),
                src_channel: c.src_channel,
                dst: c.dst,
                dst_port: c.dst_port.clone(),
                dst_channel: c.dst_channel,
                delay: c.delay,
            })
            .collect();
        Self::new(federates, entries)
    }

    pub fn federates(&self) -> &[FederateId] {
        &self.federates
    }

    pub fn contains(&self, federate: FederateId) -> bool {
        self.federates.contains(&federate)
    }

    pub fn entries(&self) -> &[ConnectionEntry] {
        &self.entries
    }

    pub fn entry(&self, index: u32) -> Option<&ConnectionEntry> {
        self.entries.get(index as usize)
    }

    /// Connections with `federate` at either end.
    pub fn entries_for(&self, federate: FederateId) -> Vec<ConnectionEntry> {
        self.entries
            .iter()
            .filter(|e| e.src == federate || e.dst == federate)
            .cloned()
            .collect()
    }

    /// Distinct `(source, delay)` pairs feeding `federate`.
    pub fn upstream(&self, federate: FederateId) -> &[(FederateId, Option<Interval>)] {
        self.upstream.get(&federate).map_or(&[], Vec::as_slice)
    }

    pub fn downstream(&self, federate: FederateId) -> BTreeSet<FederateId> {
        self.entries
            .iter()
            .filter(|e| e.src == federate)
            .map(|e| e.dst)
            .collect()
    }

    /// Every federate reachable from `federate`, excluding itself unless it
    /// lies on a cycle.
    pub fn transitive_downstream(&self, federate: FederateId) -> BTreeSet<FederateId> {
        self.reachable(federate, |_| true)
    }

    /// Whether `federate` can reach itself through connections without
    /// delay.
    pub fn in_zero_delay_cycle(&self, federate: FederateId) -> bool {
        self.reachable(federate, |e| e.delay.is_none())
            .contains(&federate)
    }

    fn reachable(
        &self,
        from: FederateId,
        follow: impl Fn(&ConnectionEntry) -> bool,
    ) -> BTreeSet<FederateId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            for entry in self.entries.iter().filter(|e| e.src == current && follow(e)) {
                if seen.insert(entry.dst) {
                    stack.push(entry.dst);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfigBuilder;
    use crate::types::msec;

    fn ring(delay_back: Option<Interval>) -> Topology {
        let config = RuntimeConfigBuilder::new()
            .add_federate(1, "a")
            .add_federate(2, "b")
            .add_federate(3, "c")
            .connect(1, "a.out", 2, "b.in", None)
            .connect(2, "b.out", 1, "a.in", delay_back)
            .connect(2, "b.out", 3, "c.in", Some(msec(5)))
            .build()
            .unwrap();
        Topology::from_config(&config)
    }

    #[test]
    fn test_entries_for() {
        let topo = ring(None);
        assert_eq!(topo.entries_for(2).len(), 3);
        assert_eq!(topo.entries_for(3).len(), 1);
        assert_eq!(topo.entry(2).unwrap().dst, 3);
        assert!(topo.entry(3).is_none());
    }

    #[test]
    fn test_upstream_and_downstream() {
        let topo = ring(Some(0));
        assert_eq!(topo.upstream(1), &[(2, Some(0))]);
        assert_eq!(topo.downstream(2), BTreeSet::from([1, 3]));
        assert!(topo.upstream(4).is_empty());
        assert_eq!(topo.transitive_downstream(3), BTreeSet::new());
        assert_eq!(topo.transitive_downstream(1), BTreeSet::from([1, 2, 3]));
    }

    #[test]
    fn test_zero_delay_cycle() {
        let topo = ring(None);
        assert!(topo.in_zero_delay_cycle(1));
        assert!(topo.in_zero_delay_cycle(2));
        assert!(!topo.in_zero_delay_cycle(3));

        // one microstep of delay breaks the cycle
        let topo = ring(Some(0));
        assert!(!topo.in_zero_delay_cycle(1));
    }
}
