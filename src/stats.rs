//! Run statistics, execution traces and their export formats.
//!
//! Each layer keeps its own counters: [`SchedulerStats`] for tag
//! processing, [`FederateStats`] for the federate side of the protocol and
//! [`CoordinatorStats`] for the coordinator. A finished run is summarised in
//! a [`RunReport`] (one scheduler or federate) or a [`CoordinatorReport`],
//! both exportable as JSON, CSV or a human-readable summary.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::port::{PortRef, Value};
use crate::tag::Tag;
use crate::types::FederateId;

/// Counters kept by the local scheduler.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Tags whose reactions were run
    pub tags_processed: u64,
    /// Reaction bodies invoked
    pub reactions_fired: u64,
    /// Levels that ran more than one reaction
    pub parallel_levels: u64,
    /// Events inserted into the event queue
    pub events_scheduled: u64,
    /// Events dropped because they fell after the stop tag
    pub events_discarded: u64,
    /// Largest event queue size observed
    pub peak_queue_size: usize,
    /// Reactions that ran their deadline handler instead
    pub deadline_violations: u64,
}

/// Counters kept by a federate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FederateStats {
    pub next_event_tags_sent: u64,
    pub grants_received: u64,
    pub provisional_grants_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub absent_sent: u64,
    /// Times the federate blocked waiting for a grant
    pub grant_waits: u64,
    /// Grant waits that exceeded the configured bound
    pub grant_timeouts: u64,
}

/// Counters kept by the coordinator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub grants_issued: u64,
    pub provisional_grants_issued: u64,
    pub messages_routed: u64,
    pub absent_routed: u64,
    pub acks_sent: u64,
    pub stop_negotiations: u64,
    pub resigned: u64,
    pub failed: u64,
}

/// Port values present at the end of one tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub tag: Tag,
    pub values: Vec<(PortRef, Value)>,
}

/// Summary of one scheduler or federate run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub name: String,
    pub final_tag: Tag,
    pub wall_time_ms: f64,
    pub scheduler: SchedulerStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federate: Option<FederateStats>,
    /// Present only when tracing was enabled.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TagRecord>,
}

impl RunReport {
    /// Counters as a JSON tree, without the trace.
    pub fn export_stats(&self) -> serde_json::Value {
        let mut stats = serde_json::json!({
            "run": {
                "name": self.name,
                "final_tag": self.final_tag.to_string(),
                "wall_time_ms": self.wall_time_ms,
            },
            "scheduler": self.scheduler,
        });
        if let Some(federate) = &self.federate {
            stats["federate"] = serde_json::json!(federate);
        }
        stats
    }

    /// Exports the report as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Writes the JSON export to a file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Exports the counters as `metric,value` rows.
    pub fn to_csv(&self) -> String {
        let s = &self.scheduler;
        let mut csv = String::from("metric,value\n");
        csv.push_str(&format!("final_tag,\"{}\"\n", self.final_tag));
        csv.push_str(&format!("wall_time_ms,{:.2}\n", self.wall_time_ms));
        csv.push_str(&format!("tags_processed,{}\n", s.tags_processed));
        csv.push_str(&format!("reactions_fired,{}\n", s.reactions_fired));
        csv.push_str(&format!("parallel_levels,{}\n", s.parallel_levels));
        csv.push_str(&format!("events_scheduled,{}\n", s.events_scheduled));
        csv.push_str(&format!("events_discarded,{}\n", s.events_discarded));
        csv.push_str(&format!("peak_queue_size,{}\n", s.peak_queue_size));
        csv.push_str(&format!("deadline_violations,{}\n", s.deadline_violations));
        if let Some(f) = &self.federate {
            csv.push_str(&format!("next_event_tags_sent,{}\n", f.next_event_tags_sent));
            csv.push_str(&format!("grants_received,{}\n", f.grants_received));
            csv.push_str(&format!(
                "provisional_grants_received,{}\n",
                f.provisional_grants_received
            ));
            csv.push_str(&format!("messages_sent,{}\n", f.messages_sent));
            csv.push_str(&format!("messages_received,{}\n", f.messages_received));
            csv.push_str(&format!("absent_sent,{}\n", f.absent_sent));
            csv.push_str(&format!("grant_waits,{}\n", f.grant_waits));
            csv.push_str(&format!("grant_timeouts,{}\n", f.grant_timeouts));
        }
        csv
    }

    /// Writes a human-readable summary.
    pub fn write_summary<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        writeln!(w, "=== Run: {} ===", self.name)?;
        writeln!(w, "Final tag: {}", self.final_tag)?;
        writeln!(w, "Wall time: {:.2} ms", self.wall_time_ms)?;
        writeln!(w)?;
        writeln!(w, "--- Scheduler ---")?;
        writeln!(w, "Tags processed: {}", self.scheduler.tags_processed)?;
        writeln!(w, "Reactions fired: {}", self.scheduler.reactions_fired)?;
        writeln!(w, "Events scheduled: {}", self.scheduler.events_scheduled)?;
        writeln!(w, "Events discarded: {}", self.scheduler.events_discarded)?;
        writeln!(w, "Peak queue: {}", self.scheduler.peak_queue_size)?;
        if let Some(f) = &self.federate {
            writeln!(w)?;
            writeln!(w, "--- Federate ---")?;
            writeln!(
                w,
                "Grants: {} (+{} provisional)",
                f.grants_received, f.provisional_grants_received
            )?;
            writeln!(w, "Messages: {} sent, {} received", f.messages_sent, f.messages_received)?;
            writeln!(w, "Grant waits: {} ({} timed out)", f.grant_waits, f.grant_timeouts)?;
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        let mut buf = Vec::new();
        let _ = self.write_summary(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Summary of a coordinator run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoordinatorReport {
    pub wall_time_ms: f64,
    pub stats: CoordinatorStats,
    /// Last completed tag of each federate.
    pub completed: BTreeMap<FederateId, Tag>,
    pub stop_tag: Option<Tag>,
}

impl CoordinatorReport {
    pub fn export_stats(&self) -> serde_json::Value {
        let completed: serde_json::Map<String, serde_json::Value> = self
            .completed
            .iter()
            .map(|(id, tag)| (id.to_string(), serde_json::json!(tag.to_string())))
            .collect();
        serde_json::json!({
            "coordinator": self.stats,
            "wall_time_ms": self.wall_time_ms,
            "completed": completed,
            "stop_tag": self.stop_tag.map(|t| t.to_string()),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_csv(&self) -> String {
        let s = &self.stats;
        let mut csv = String::from("metric,value\n");
        csv.push_str(&format!("wall_time_ms,{:.2}\n", self.wall_time_ms));
        csv.push_str(&format!("grants_issued,{}\n", s.grants_issued));
        csv.push_str(&format!("provisional_grants_issued,{}\n", s.provisional_grants_issued));
        csv.push_str(&format!("messages_routed,{}\n", s.messages_routed));
        csv.push_str(&format!("absent_routed,{}\n", s.absent_routed));
        csv.push_str(&format!("acks_sent,{}\n", s.acks_sent));
        csv.push_str(&format!("stop_negotiations,{}\n", s.stop_negotiations));
        csv.push_str(&format!("resigned,{}\n", s.resigned));
        csv.push_str(&format!("failed,{}\n", s.failed));
        csv
    }
}

/// A simple timer for measuring wall-clock time.
#[derive(Debug)]
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}
