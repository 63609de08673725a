//! Shared test reactors and an in-process federation harness.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kairos::config::RuntimeConfig;
use kairos::federated::{memory_pair, Coordinator, Endpoint, Federate, FrameWriter};
use kairos::graph::{Program, ProgramBuilder};
use kairos::reaction::{reactor_fn, ReactionOutcome, ReactionSpec};
use kairos::stats::{CoordinatorReport, RunReport};
use kairos::types::{FederateId, Interval};
use kairos::{RuntimeResult, Tag};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

// ============================================================================
// Recorder
// ============================================================================

/// Collects `(tag, value)` pairs seen by a reaction.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<(Tag, Value)>>>);

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tag: Tag, value: Value) {
        self.0.lock().push((tag, value));
    }

    pub fn entries(&self) -> Vec<(Tag, Value)> {
        self.0.lock().clone()
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.0.lock().iter().map(|(t, _)| *t).collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

// ============================================================================
// Test Programs
// ============================================================================

/// `source.out` carries 1, 2, 3, ... on a periodic timer.
pub fn counter_source(period: Interval) -> Program {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("source");
    let tick = b.add_timer(r, "tick", 0, period);
    let out = b.add_output(r, "out");
    b.add_reaction(r, ReactionSpec::new().on_timer(tick).writes(out));
    let mut count = 0i64;
    b.set_body(
        r,
        reactor_fn(move |_, ctx| {
            count += 1;
            ctx.set(out, count);
            ReactionOutcome::Ok
        }),
    )
    .unwrap();
    b.build().unwrap()
}

/// `sink.in` records every value it receives.
pub fn recording_sink(recorder: Recorder) -> Program {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("sink");
    let input = b.add_input(r, "in");
    b.add_reaction(r, ReactionSpec::new().on_port(input));
    b.set_body(
        r,
        reactor_fn(move |_, ctx| {
            if let Some(v) = ctx.get(input) {
                recorder.push(ctx.tag(), v.clone());
            }
            ReactionOutcome::Ok
        }),
    )
    .unwrap();
    b.build().unwrap()
}

/// `ping.out` counts on a timer; `ping.in` is recorded.
pub fn pinger(period: Interval, recorder: Recorder) -> Program {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("ping");
    let tick = b.add_timer(r, "tick", 0, period);
    let out = b.add_output(r, "out");
    let input = b.add_input(r, "in");
    b.add_reaction(r, ReactionSpec::new().on_timer(tick).writes(out));
    b.add_reaction(r, ReactionSpec::new().on_port(input));
    let mut count = 0i64;
    b.set_body(
        r,
        reactor_fn(move |reaction, ctx| {
            match reaction {
                0 => {
                    count += 1;
                    ctx.set(out, count);
                }
                _ => {
                    if let Some(v) = ctx.get(input) {
                        recorder.push(ctx.tag(), v.clone());
                    }
                }
            }
            ReactionOutcome::Ok
        }),
    )
    .unwrap();
    b.build().unwrap()
}

/// `echo.out` is `echo.in + 1` at the same tag.
pub fn echo() -> Program {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("echo");
    let input = b.add_input(r, "in");
    let out = b.add_output(r, "out");
    b.add_reaction(r, ReactionSpec::new().on_port(input).writes(out));
    b.set_body(
        r,
        reactor_fn(move |_, ctx| {
            if let Some(n) = ctx.get_as::<i64>(input) {
                ctx.set(out, n + 1);
            }
            ReactionOutcome::Ok
        }),
    )
    .unwrap();
    b.build().unwrap()
}

// ============================================================================
// Federation Harness
// ============================================================================

/// Delays every frame by a random pause before writing it.
pub struct Jitter {
    inner: Box<dyn FrameWriter>,
    rng: StdRng,
    max_micros: u64,
}

impl FrameWriter for Jitter {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let pause = self.rng.gen_range(0..=self.max_micros);
        thread::sleep(Duration::from_micros(pause));
        self.inner.write_frame(frame)
    }
}

fn jittered(endpoint: Endpoint, seed: u64, max_micros: u64) -> Endpoint {
    let Endpoint { writer, reader } = endpoint;
    Endpoint::new(
        Box::new(Jitter {
            inner: writer,
            rng: StdRng::seed_from_u64(seed),
            max_micros,
        }),
        reader,
    )
}

pub struct Outcome {
    pub coordinator: RuntimeResult<CoordinatorReport>,
    pub federates: BTreeMap<FederateId, RuntimeResult<RunReport>>,
}

impl Outcome {
    pub fn report(&self, id: FederateId) -> &RunReport {
        match &self.federates[&id] {
            Ok(report) => report,
            Err(err) => panic!("federate {id} failed: {err}"),
        }
    }

    pub fn coordinator(&self) -> &CoordinatorReport {
        match &self.coordinator {
            Ok(report) => report,
            Err(err) => panic!("coordinator failed: {err}"),
        }
    }
}

/// Runs a whole federation in this process over in-memory links. With a
/// seed, every frame in both directions is delayed by up to `max_micros`.
pub fn run_federation(
    config: &RuntimeConfig,
    programs: Vec<(FederateId, Program)>,
    jitter: Option<(u64, u64)>,
) -> Outcome {
    let coordinator = Coordinator::from_config(config).unwrap();
    let mut coordinator_side = Vec::new();
    let mut federates = Vec::new();

    for (i, (id, program)) in programs.into_iter().enumerate() {
        let (ours, theirs) = memory_pair();
        let (ours, theirs) = match jitter {
            Some((seed, max)) => (
                jittered(ours, seed + 2 * i as u64, max),
                jittered(theirs, seed + 2 * i as u64 + 1, max),
            ),
            None => (ours, theirs),
        };
        coordinator_side.push(theirs);
        let options = config.federate_options(id).unwrap();
        let handle = thread::Builder::new()
            .name(format!("federate-{id}"))
            .spawn(move || Federate::join(program, options, ours)?.run())
            .unwrap();
        federates.push((id, handle));
    }

    let coordinator = coordinator.run(coordinator_side);
    let federates = federates
        .into_iter()
        .map(|(id, handle)| (id, handle.join().unwrap()))
        .collect();
    Outcome {
        coordinator,
        federates,
    }
}

/// The values of a recording as plain integers.
pub fn ints(entries: &[(Tag, Value)]) -> Vec<i64> {
    entries.iter().filter_map(|(_, v)| v.as_i64()).collect()
}
