//! Connections between ports.
//!
//! A [`ConnectionDesc`] wires a range of source channels to a range of
//! destination channels. Ranges may span several ports, which is how a bank
//! of reactors is addressed: the channels of each bank member are listed in
//! bank order, giving the row-major `[bank, channel]` layout of
//! [`mixed_radix`](crate::mixed_radix). Interleaved ranges enumerate the
//! same channels channel-major instead.
//!
//! # Delays
//!
//! | delay      | arrival of a value sent at `(t, m)` |
//! |------------|-------------------------------------|
//! | `None`     | `(t, m)`, same tag                  |
//! | `Some(0)`  | `(t, m + 1)`                        |
//! | `Some(d)`  | `(t + d, 0)`                        |
//!
//! # Example
//!
//! ```
//! use kairos::connection::{ConnectionDesc, PortRange};
//! use kairos::port::PortRef;
//!
//! // out (width 2) of reactor port 0 -> two single-width inputs 1 and 2
//! let conn = ConnectionDesc::new(0, PortRange::bank(vec![1, 2])).with_delay(5);
//! let widths = |p: usize| Some(if p == 0 { 2 } else { 1 });
//! let edges = conn.expand(0, &widths).unwrap();
//! assert_eq!(edges[1].src, PortRef::new(0, 1));
//! assert_eq!(edges[1].dst, PortRef::new(2, 0));
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GraphError;
use crate::mixed_radix;
use crate::port::PortRef;
use crate::tag::Tag;
use crate::types::{Interval, PortId};

/// A contiguous run of channels on one port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub port: PortId,
    /// First channel.
    pub start: usize,
    /// Number of channels; `None` runs to the end of the port.
    pub len: Option<usize>,
}

/// An ordered list of channels, possibly across several ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub segments: Vec<Segment>,
    /// Enumerate channel-major across segments instead of segment-major.
    #[serde(default)]
    pub interleaved: bool,
}

impl PortRange {
    /// Every channel of `port`.
    pub fn whole(port: PortId) -> Self {
        Self {
            segments: vec![Segment {
                port,
                start: 0,
                len: None,
            }],
            interleaved: false,
        }
    }

    /// `len` channels of `port` starting at `start`.
    pub fn channels(port: PortId, start: usize, len: usize) -> Self {
        Self {
            segments: vec![Segment {
                port,
                start,
                len: Some(len),
            }],
            interleaved: false,
        }
    }

    /// The same port on every member of a bank, in bank order.
    pub fn bank(ports: Vec<PortId>) -> Self {
        Self {
            segments: ports
                .into_iter()
                .map(|port| Segment {
                    port,
                    start: 0,
                    len: None,
                })
                .collect(),
            interleaved: false,
        }
    }

    /// Switches to channel-major enumeration.
    pub fn interleave(mut self) -> Self {
        self.interleaved = true;
        self
    }

    /// Lists the channels of this range in connection order.
    pub fn resolve(
        &self,
        connection: usize,
        widths: &dyn Fn(PortId) -> Option<usize>,
    ) -> Result<Vec<PortRef>, GraphError> {
        let mut refs = Vec::new();
        let mut run_len = None;
        for seg in &self.segments {
            let width = widths(seg.port).ok_or(GraphError::UnknownId {
                kind: "port",
                id: seg.port,
            })?;
            let len = seg.len.unwrap_or(width.saturating_sub(seg.start));
            if seg.start + len > width {
                return Err(GraphError::InvalidConnection {
                    connection,
                    reason: format!(
                        "channels {}..{} exceed width {} of port {}",
                        seg.start,
                        seg.start + len,
                        width,
                        seg.port
                    ),
                });
            }
            if self.interleaved && run_len.map_or(false, |l| l != len) {
                return Err(GraphError::InvalidConnection {
                    connection,
                    reason: "interleaved ranges need equal segment widths".into(),
                });
            }
            run_len = Some(len);
            refs.extend((seg.start..seg.start + len).map(|c| PortRef::new(seg.port, c)));
        }

        if !self.interleaved || refs.is_empty() {
            return Ok(refs);
        }
        let banks = self.segments.len();
        let width = run_len.unwrap_or(0);
        // position k in channel-major order is digits (channel, bank)
        (0..refs.len())
            .map(|k| {
                mixed_radix::permute(k, &[width, banks], &[1, 0])
                    .map(|i| refs[i])
                    .ok_or_else(|| GraphError::InvalidConnection {
                        connection,
                        reason: "interleaved index out of range".into(),
                    })
            })
            .collect()
    }
}

impl From<PortId> for PortRange {
    fn from(port: PortId) -> Self {
        PortRange::whole(port)
    }
}

impl From<PortRef> for PortRange {
    fn from(slot: PortRef) -> Self {
        PortRange::channels(slot.port, slot.channel, 1)
    }
}

/// Describes a connection between two port ranges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDesc {
    pub src: PortRange,
    pub dst: PortRange,
    /// `None` for same-tag delivery.
    #[serde(default)]
    pub delay: Option<Interval>,
    /// Repeat the source range to cover a wider destination.
    #[serde(default)]
    pub broadcast: bool,
}

impl ConnectionDesc {
    /// Creates a same-tag connection.
    pub fn new(src: impl Into<PortRange>, dst: impl Into<PortRange>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            delay: None,
            broadcast: false,
        }
    }

    /// Sets an `after` delay. Zero means one microstep.
    pub fn with_delay(mut self, delay: Interval) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Repeats the source channels across the destination.
    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    /// Expands this connection into one edge per destination channel.
    ///
    /// # Arguments
    /// * `index` - Position of this connection, used in error reports
    /// * `widths` - Port width lookup
    pub fn expand(
        &self,
        index: usize,
        widths: &dyn Fn(PortId) -> Option<usize>,
    ) -> Result<Vec<Edge>, GraphError> {
        if let Some(delay) = self.delay {
            if delay < 0 {
                return Err(GraphError::NegativeDelay {
                    connection: index,
                    delay,
                });
            }
        }
        let src = self.src.resolve(index, widths)?;
        let dst = self.dst.resolve(index, widths)?;
        if src.is_empty() || dst.is_empty() {
            return Err(GraphError::InvalidConnection {
                connection: index,
                reason: "empty port range".into(),
            });
        }

        let edges: Vec<Edge> = if self.broadcast {
            dst.iter()
                .enumerate()
                .map(|(i, &d)| Edge::new(src[i % src.len()], d, self.delay))
                .collect()
        } else {
            if src.len() != dst.len() {
                warn!(
                    connection = index,
                    src = src.len(),
                    dst = dst.len(),
                    "connection widths differ, extra channels left unconnected"
                );
            }
            src.iter()
                .zip(&dst)
                .map(|(&s, &d)| Edge::new(s, d, self.delay))
                .collect()
        };
        Ok(edges)
    }
}

/// A single channel-to-channel link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub src: PortRef,
    pub dst: PortRef,
    pub delay: Option<Interval>,
}

impl Edge {
    pub fn new(src: PortRef, dst: PortRef, delay: Option<Interval>) -> Self {
        Self { src, dst, delay }
    }

    /// Tag at which a value sent at `sent` reaches `dst`.
    #[inline]
    pub fn arrival_tag(&self, sent: Tag) -> Tag {
        sent.delayed(self.delay)
    }

    /// True for same-tag edges.
    #[inline]
    pub fn is_instantaneous(&self) -> bool {
        self.delay.is_none()
    }
}

/// All edges of a program with lookup by channel.
#[derive(Clone, Debug, Default)]
pub struct ConnectionTable {
    edges: Vec<Edge>,
    outgoing: HashMap<PortRef, Vec<usize>>,
    incoming: HashMap<PortRef, Vec<usize>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, edge: Edge) {
        let index = self.edges.len();
        self.outgoing.entry(edge.src).or_default().push(index);
        self.incoming.entry(edge.dst).or_default().push(index);
        self.edges.push(edge);
    }

    /// Edges leaving `slot`, in insertion order.
    pub fn outgoing(&self, slot: PortRef) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(&slot)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// Edges entering `slot`, in insertion order.
    pub fn incoming(&self, slot: PortRef) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(&slot)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    pub fn all(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::msec;

    fn widths(p: PortId) -> Option<usize> {
        match p {
            0 => Some(4),
            1 | 2 => Some(2),
            3 => Some(1),
            _ => None,
        }
    }

    // ========== Expansion Tests ==========

    #[test]
    fn test_whole_port_pairs_channels() {
        let edges = ConnectionDesc::new(0, PortRange::bank(vec![1, 2]))
            .expand(0, &widths)
            .unwrap();
        let dst: Vec<PortRef> = edges.iter().map(|e| e.dst).collect();
        assert_eq!(
            dst,
            vec![
                PortRef::new(1, 0),
                PortRef::new(1, 1),
                PortRef::new(2, 0),
                PortRef::new(2, 1)
            ]
        );
        assert_eq!(edges[3].src, PortRef::new(0, 3));
    }

    #[test]
    fn test_interleaved_bank() {
        let edges = ConnectionDesc::new(PortRange::bank(vec![1, 2]).interleave(), 0)
            .expand(0, &widths)
            .unwrap();
        let src: Vec<PortRef> = edges.iter().map(|e| e.src).collect();
        assert_eq!(
            src,
            vec![
                PortRef::new(1, 0),
                PortRef::new(2, 0),
                PortRef::new(1, 1),
                PortRef::new(2, 1)
            ]
        );
    }

    #[test]
    fn test_broadcast_repeats_source() {
        let edges = ConnectionDesc::new(3, 0).broadcast().expand(0, &widths).unwrap();
        assert_eq!(edges.len(), 4);
        assert!(edges.iter().all(|e| e.src == PortRef::single(3)));
    }

    #[test]
    fn test_mismatched_widths_truncate() {
        let edges = ConnectionDesc::new(3, 0).expand(0, &widths).unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[test]
    fn test_out_of_range_segment() {
        let err = ConnectionDesc::new(PortRange::channels(1, 1, 2), 0)
            .expand(7, &widths)
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidConnection { connection: 7, .. }));
    }

    #[test]
    fn test_negative_delay_rejected() {
        let err = ConnectionDesc::new(3, 1)
            .with_delay(-1)
            .expand(2, &widths)
            .unwrap_err();
        assert_eq!(err, GraphError::NegativeDelay { connection: 2, delay: -1 });
    }

    #[test]
    fn test_unknown_port() {
        let err = ConnectionDesc::new(9, 1).expand(0, &widths).unwrap_err();
        assert_eq!(err, GraphError::UnknownId { kind: "port", id: 9 });
    }

    // ========== Arrival Tests ==========

    #[test]
    fn test_arrival_tag() {
        let sent = Tag::new(msec(3), 2);
        let same = Edge::new(PortRef::single(0), PortRef::single(1), None);
        let micro = Edge::new(PortRef::single(0), PortRef::single(1), Some(0));
        let later = Edge::new(PortRef::single(0), PortRef::single(1), Some(msec(10)));
        assert_eq!(same.arrival_tag(sent), sent);
        assert!(same.is_instantaneous());
        assert_eq!(micro.arrival_tag(sent), Tag::new(msec(3), 3));
        assert_eq!(later.arrival_tag(sent), Tag::at(msec(13)));
    }

    // ========== Table Tests ==========

    #[test]
    fn test_table_lookup() {
        let mut table = ConnectionTable::new();
        table.add(Edge::new(PortRef::single(0), PortRef::single(1), None));
        table.add(Edge::new(PortRef::single(0), PortRef::single(2), Some(5)));
        table.add(Edge::new(PortRef::single(3), PortRef::single(2), None));

        assert_eq!(table.outgoing(PortRef::single(0)).count(), 2);
        assert_eq!(table.incoming(PortRef::single(2)).count(), 2);
        assert_eq!(table.outgoing(PortRef::single(9)).count(), 0);
        assert_eq!(table.len(), 3);
    }
}
