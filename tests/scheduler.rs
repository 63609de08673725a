//! Integration tests for the local scheduler.
//!
//! These tests verify whole-program behavior:
//! - Tag ordering and microsteps
//! - Connection delays and multiport/bank wiring
//! - Deterministic results regardless of worker count
//! - Timeouts, stop requests and faults

mod common;

use std::sync::Arc;

use common::Recorder;
use kairos::connection::{ConnectionDesc, PortRange};
use kairos::graph::{Program, ProgramBuilder};
use kairos::reaction::{reactor_fn, ReactionContext, ReactionOutcome, ReactionSpec, Reactor};
use kairos::stats::RunReport;
use kairos::types::{msec, usec, PortId};
use kairos::{LocalScheduler, RuntimeError, SchedulerOptions, Tag};
use parking_lot::Mutex;
use serde_json::json;

fn fast() -> SchedulerOptions {
    SchedulerOptions::default().with_fast(true).with_trace(true)
}

fn run(program: Program, options: SchedulerOptions) -> RunReport {
    LocalScheduler::new(program, options).run().unwrap()
}

/// Adds a reactor whose single reaction records `in`.
fn add_sink(b: &mut ProgramBuilder, name: &str, recorder: Recorder) -> PortId {
    let r = b.add_reactor(name);
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
    input
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_tags_strictly_increase() {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("bouncer");
    let tick = b.add_timer(r, "tick", 0, msec(1));
    let again = b.add_logical_action(r, "again", 0);
    let out = b.add_output(r, "out");
    b.add_reaction(r, ReactionSpec::new().on_timer(tick).schedules(again));
    b.add_reaction(
        r,
        ReactionSpec::new().on_action(again).schedules(again).writes(out),
    );
    let mut bounces = 0;
    b.set_body(
        r,
        reactor_fn(move |reaction, ctx| {
            match reaction {
                0 => ctx.schedule(again, 0, None),
                _ => {
                    bounces += 1;
                    ctx.set(out, bounces);
                    if ctx.tag().microstep < 3 {
                        ctx.schedule(again, 0, None);
                    }
                }
            }
            ReactionOutcome::Ok
        }),
    )
    .unwrap();

    let report = run(b.build().unwrap(), fast().with_timeout(msec(2)));
    let tags: Vec<Tag> = report.trace.iter().map(|r| r.tag).collect();
    assert!(tags.windows(2).all(|w| w[0] < w[1]));
    // three microsteps after each of the first two timer firings
    for time in [0, msec(1)] {
        for step in 1..=3 {
            assert!(tags.contains(&Tag::new(time, step)), "missing ({time}, {step})");
        }
    }
    assert_eq!(report.final_tag, Tag::at(msec(2)));
}

#[test]
fn test_last_write_wins_in_reaction_order() {
    let recorder = Recorder::new();
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("writer");
    let out = b.add_output(r, "out");
    b.add_reaction(r, ReactionSpec::new().on_startup().writes(out));
    b.add_reaction(r, ReactionSpec::new().on_startup().writes(out));
    b.set_body(
        r,
        reactor_fn(move |reaction, ctx| {
            if reaction == 0 {
                ctx.set(out, 1);
            } else {
                ctx.set(out, 3);
                ctx.set(out, 4);
            }
            ReactionOutcome::Ok
        }),
    )
    .unwrap();
    let input = add_sink(&mut b, "sink", recorder.clone());
    b.connect(ConnectionDesc::new(out, input));

    run(b.build().unwrap(), fast());
    assert_eq!(recorder.entries(), vec![(Tag::ZERO, json!(4))]);
}

// ============================================================================
// Connections
// ============================================================================

#[test]
fn test_connection_delays() {
    let same = Recorder::new();
    let micro = Recorder::new();
    let later = Recorder::new();
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("source");
    let out = b.add_output(r, "out");
    b.add_reaction(r, ReactionSpec::new().on_startup().writes(out));
    b.set_body(
        r,
        reactor_fn(move |_, ctx| {
            ctx.set(out, "hello");
            ReactionOutcome::Ok
        }),
    )
    .unwrap();
    let a = add_sink(&mut b, "same", same.clone());
    let c = add_sink(&mut b, "micro", micro.clone());
    let d = add_sink(&mut b, "later", later.clone());
    b.connect(ConnectionDesc::new(out, a));
    b.connect(ConnectionDesc::new(out, c).with_delay(0));
    b.connect(ConnectionDesc::new(out, d).with_delay(msec(5)));

    let report = run(b.build().unwrap(), fast());
    assert_eq!(same.tags(), vec![Tag::ZERO]);
    assert_eq!(micro.tags(), vec![Tag::new(0, 1)]);
    assert_eq!(later.tags(), vec![Tag::at(msec(5))]);
    // stops at the microstep after the last event
    assert_eq!(report.final_tag, Tag::new(msec(5), 1));
}

/// A source with a width-4 output feeds a bank of four workers whose
/// outputs are gathered by one multiport input.
fn bank_program(total: Recorder) -> Program {
    const WIDTH: usize = 4;
    let mut b = ProgramBuilder::new();

    let src = b.add_reactor("source");
    let tick = b.add_timer(src, "tick", 0, usec(100));
    let fan = b.add_multiport_output(src, "out", WIDTH);
    b.add_reaction(src, ReactionSpec::new().on_timer(tick).writes(fan));
    let mut round = 0i64;
    b.set_body(
        src,
        reactor_fn(move |_, ctx| {
            round += 1;
            for channel in 0..WIDTH {
                ctx.set_channel(fan, channel, round * 100 + channel as i64);
            }
            ReactionOutcome::Ok
        }),
    )
    .unwrap();

    let mut worker_in = Vec::new();
    let mut worker_out = Vec::new();
    for i in 0..WIDTH {
        let w = b.add_reactor(format!("worker{i}"));
        let input = b.add_input(w, "in");
        let out = b.add_output(w, "out");
        b.add_reaction(w, ReactionSpec::new().on_port(input).writes(out));
        b.set_body(
            w,
            reactor_fn(move |_, ctx| {
                if let Some(n) = ctx.get_as::<i64>(input) {
                    // enough work for the pool to interleave
                    let spin: i64 = (0..2_000).map(|k| (k * n) % 7).sum();
                    std::hint::black_box(spin);
                    ctx.set(out, n * 2);
                }
                ReactionOutcome::Ok
            }),
        )
        .unwrap();
        worker_in.push(input);
        worker_out.push(out);
    }

    let agg = b.add_reactor("gather");
    let gathered = b.add_multiport_input(agg, "in", WIDTH);
    b.add_reaction(agg, ReactionSpec::new().on_port(gathered));
    b.set_body(
        agg,
        reactor_fn(move |_, ctx| {
            let values: Vec<i64> = (0..ctx.width(gathered))
                .filter_map(|c| ctx.get_channel(gathered, c).and_then(|v| v.as_i64()))
                .collect();
            total.push(ctx.tag(), json!(values));
            ReactionOutcome::Ok
        }),
    )
    .unwrap();

    b.connect(ConnectionDesc::new(fan, PortRange::bank(worker_in)));
    b.connect(ConnectionDesc::new(PortRange::bank(worker_out), gathered));
    b.build().unwrap()
}

#[test]
fn test_bank_and_multiport_wiring() {
    let total = Recorder::new();
    run(bank_program(total.clone()), fast().with_timeout(usec(200)));
    assert_eq!(
        total.entries(),
        vec![
            (Tag::ZERO, json!([200, 202, 204, 206])),
            (Tag::at(usec(100)), json!([400, 402, 404, 406])),
            (Tag::at(usec(200)), json!([600, 602, 604, 606])),
        ]
    );
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_parallel_matches_sequential() {
    let sequential = Recorder::new();
    let parallel = Recorder::new();
    let options = fast().with_timeout(msec(5));

    let seq = run(bank_program(sequential.clone()), options.clone().with_workers(1));
    let par = run(bank_program(parallel.clone()), options.with_workers(4));

    assert_eq!(sequential.entries(), parallel.entries());
    assert_eq!(seq.trace, par.trace);
    assert_eq!(seq.scheduler.reactions_fired, par.scheduler.reactions_fired);
    assert_eq!(seq.final_tag, Tag::at(msec(5)));
}

#[test]
fn test_replay_is_identical() {
    let first = run(bank_program(Recorder::new()), fast().with_timeout(msec(2)));
    let second = run(bank_program(Recorder::new()), fast().with_timeout(msec(2)));
    assert_eq!(first.trace, second.trace);
    assert_eq!(first.scheduler, second.scheduler);
    assert_eq!(first.final_tag, second.final_tag);
}

// ============================================================================
// Stopping
// ============================================================================

#[test]
fn test_timeout_discards_later_events() {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("r");
    let late = b.add_logical_action(r, "late", msec(10));
    b.add_reaction(r, ReactionSpec::new().on_startup().schedules(late));
    b.add_reaction(r, ReactionSpec::new().on_action(late));
    let fired = Arc::new(Mutex::new(false));
    let f = Arc::clone(&fired);
    b.set_body(
        r,
        reactor_fn(move |reaction, ctx| {
            if reaction == 0 {
                ctx.schedule(late, 0, None);
            } else {
                *f.lock() = true;
            }
            ReactionOutcome::Ok
        }),
    )
    .unwrap();

    let report = run(b.build().unwrap(), fast().with_timeout(msec(5)));
    assert!(!*fired.lock());
    assert_eq!(report.final_tag, Tag::at(msec(5)));
    assert_eq!(report.scheduler.events_discarded, 1);
}

#[test]
fn test_shutdown_reactions_see_stop_tag() {
    let seen = Recorder::new();
    let s = seen.clone();
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("r");
    let tick = b.add_timer(r, "tick", msec(1), msec(1));
    b.add_reaction(r, ReactionSpec::new().on_timer(tick));
    b.add_reaction(r, ReactionSpec::new().on_shutdown());
    b.set_body(
        r,
        reactor_fn(move |reaction, ctx| {
            if reaction == 0 && ctx.logical_time() == msec(4) {
                ctx.request_stop();
            }
            if reaction == 1 {
                s.push(ctx.tag(), json!("shutdown"));
            }
            ReactionOutcome::Ok
        }),
    )
    .unwrap();

    let report = run(b.build().unwrap(), fast());
    assert_eq!(seen.tags(), vec![Tag::new(msec(4), 1)]);
    assert_eq!(report.final_tag, Tag::new(msec(4), 1));
}

// ============================================================================
// Faults and Deadlines
// ============================================================================

struct Flaky {
    out: PortId,
    fail_at: i64,
}

impl Reactor for Flaky {
    fn react(&mut self, _reaction: usize, ctx: &mut ReactionContext<'_>) -> ReactionOutcome {
        if ctx.logical_time() >= self.fail_at {
            return ReactionOutcome::Fatal(format!("gave up at {}", ctx.tag()));
        }
        let now = ctx.logical_time();
        ctx.set(self.out, now);
        ReactionOutcome::Ok
    }
}

#[test]
fn test_fault_ends_run_with_error() {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("flaky");
    let tick = b.add_timer(r, "tick", 0, msec(1));
    let out = b.add_output(r, "out");
    b.add_reaction(r, ReactionSpec::new().on_timer(tick).writes(out));
    b.set_body(r, Box::new(Flaky { out, fail_at: msec(3) })).unwrap();

    let mut scheduler = LocalScheduler::new(b.build().unwrap(), fast());
    let err = scheduler.run().unwrap_err();
    match err {
        RuntimeError::ReactionFault {
            reactor,
            reaction,
            tag,
            reason,
        } => {
            assert_eq!(reactor, "flaky");
            assert_eq!(reaction, 0);
            assert_eq!(tag, Tag::at(msec(3)));
            assert!(reason.starts_with("gave up"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(scheduler.stats().tags_processed, 3);
}

#[test]
fn test_report_exports() {
    let report = run(bank_program(Recorder::new()), fast().with_timeout(usec(100)));
    let stats = report.export_stats();
    assert_eq!(stats["scheduler"]["tags_processed"], 2);
    assert_eq!(stats["scheduler"]["reactions_fired"], 12);
    assert!(report.to_json().unwrap().contains("\"trace\""));
    assert!(report.summary().contains("Tags processed: 2"));
}
