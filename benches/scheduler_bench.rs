//! Performance benchmarks for the kairos runtime.
//!
//! Run with: `cargo bench`
//! Or for specific bench: `cargo bench --bench scheduler_bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kairos::connection::{ConnectionDesc, PortRange};
use kairos::federated::message::Message;
use kairos::graph::{Program, ProgramBuilder};
use kairos::queue::EventQueue;
use kairos::reaction::{reactor_fn, ReactionOutcome, ReactionSpec};
use kairos::types::usec;
use kairos::{Event, LocalScheduler, SchedulerOptions, Tag};

// ============================================================================
// Benchmark Programs
// ============================================================================

/// A chain of `length` reactors, each adding one to its input.
fn chain(length: usize) -> Program {
    let mut b = ProgramBuilder::new();
    let head = b.add_reactor("head");
    let tick = b.add_timer(head, "tick", 0, usec(1));
    let mut prev = b.add_output(head, "out");
    b.add_reaction(head, ReactionSpec::new().on_timer(tick).writes(prev));
    let out = prev;
    b.set_body(
        head,
        reactor_fn(move |_, ctx| {
            ctx.set(out, 0);
            ReactionOutcome::Ok
        }),
    )
    .unwrap();

    for i in 0..length {
        let r = b.add_reactor(format!("link{i}"));
        let input = b.add_input(r, "in");
        let out = b.add_output(r, "out");
        b.add_reaction(r, ReactionSpec::new().on_port(input).writes(out));
        b.set_body(
            r,
            reactor_fn(move |_, ctx| {
                let n = ctx.get_as::<i64>(input).unwrap_or(0);
                ctx.set(out, n + 1);
                ReactionOutcome::Ok
            }),
        )
        .unwrap();
        b.connect(ConnectionDesc::new(prev, input));
        prev = out;
    }
    b.build().unwrap()
}

/// One source fanning out to `width` independent workers.
fn fan_out(width: usize, work: u64) -> Program {
    let mut b = ProgramBuilder::new();
    let src = b.add_reactor("source");
    let tick = b.add_timer(src, "tick", 0, usec(1));
    let out = b.add_multiport_output(src, "out", width);
    b.add_reaction(src, ReactionSpec::new().on_timer(tick).writes(out));
    b.set_body(
        src,
        reactor_fn(move |_, ctx| {
            for c in 0..width {
                ctx.set_channel(out, c, c as i64);
            }
            ReactionOutcome::Ok
        }),
    )
    .unwrap();

    let mut inputs = Vec::with_capacity(width);
    for i in 0..width {
        let w = b.add_reactor(format!("worker{i}"));
        let input = b.add_input(w, "in");
        b.add_reaction(w, ReactionSpec::new().on_port(input));
        b.set_body(
            w,
            reactor_fn(move |_, _| {
                black_box((0..work).fold(0u64, |acc, k| acc.wrapping_mul(31).wrapping_add(k)));
                ReactionOutcome::Ok
            }),
        )
        .unwrap();
        inputs.push(input);
    }
    b.connect(ConnectionDesc::new(out, PortRange::bank(inputs)));
    b.build().unwrap()
}

fn options(tags: i64) -> SchedulerOptions {
    SchedulerOptions::default()
        .with_fast(true)
        .with_timeout(usec(tags - 1))
}

// ============================================================================
// Scheduler Benchmarks
// ============================================================================

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");

    for length in [1, 10, 50].iter() {
        group.throughput(Throughput::Elements(100 * (*length as u64 + 1)));
        group.bench_with_input(BenchmarkId::new("reactors", length), length, |b, &length| {
            b.iter(|| {
                let mut scheduler = LocalScheduler::new(chain(length), options(100));
                black_box(scheduler.run().unwrap());
            });
        });
    }

    group.finish();
}

fn bench_parallel_vs_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_comparison");
    let width = 16;
    let work = 20_000;

    for workers in [1, 2, 4].iter() {
        group.bench_with_input(BenchmarkId::new("workers", workers), workers, |b, &workers| {
            b.iter(|| {
                let opts = options(50).with_workers(workers);
                let mut scheduler = LocalScheduler::new(fan_out(width, work), opts);
                black_box(scheduler.run().unwrap());
            });
        });
    }

    group.finish();
}

// ============================================================================
// Queue and Codec Benchmarks
// ============================================================================

fn bench_event_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_queue");

    for count in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("events", count), count, |b, &count| {
            b.iter(|| {
                let mut queue = EventQueue::new();
                // reverse order stresses insertion
                for i in (0..count as i64).rev() {
                    queue.schedule(Event::timer(Tag::at(i), 0));
                }
                while let Some(tag) = queue.next_tag() {
                    black_box(queue.pop_tag(tag));
                }
            });
        });
    }

    group.finish();
}

fn bench_wire_codec(c: &mut Criterion) {
    let msg = Message::Tagged {
        federate: 3,
        tag: Tag::new(1_000_000, 2),
        connection: 9,
        value: serde_json::json!({"samples": [1.0, 2.0, 3.0, 4.0], "unit": "V"}),
    };
    let frame = msg.encode().unwrap();

    c.bench_function("wire_encode", |b| b.iter(|| black_box(msg.encode().unwrap())));
    c.bench_function("wire_decode", |b| {
        b.iter(|| black_box(Message::decode(black_box(&frame)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_chain,
    bench_parallel_vs_sequential,
    bench_event_queue,
    bench_wire_codec,
);

criterion_main!(benches);
