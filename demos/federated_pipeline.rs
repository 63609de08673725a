//! Federated Pipeline Example
//!
//! Three federates talk to a coordinator over TCP:
//! - `sensor` samples a noisy signal every 50 ms
//! - `filter` keeps a moving average, at the same tag as each sample
//! - `display` prints the average 10 ms of logical time later
//!
//! Run with: `cargo run --example federated_pipeline`
//! Set `RUST_LOG=kairos=debug` to watch the grants go by.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::thread;

use kairos::config::RuntimeConfig;
use kairos::federated::{Coordinator, Endpoint, Federate};
use kairos::graph::{Program, ProgramBuilder};
use kairos::reaction::{reactor_fn, ReactionOutcome, ReactionSpec};
use kairos::types::{msec, FederateId};
use kairos::RunReport;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// Federation Layout
// ============================================================================

const FEDERATION: &str = r#"
runtime:
  fast: false
  timeout: 500000000

federation:
  coordination: centralized
  grant_timeout_ms: 2000
  grant_timeout_policy: warn

federates:
  - id: 1
    name: sensor
  - id: 2
    name: filter
  - id: 3
    name: display

connections:
  - src: 1
    src_port: sensor.sample
    dst: 2
    dst_port: filter.sample
  - src: 2
    src_port: filter.average
    dst: 3
    dst_port: display.average
    delay: 10000000
"#;

const WINDOW: usize = 4;

// ============================================================================
// Programs
// ============================================================================

fn sensor() -> Program {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("sensor");
    let tick = b.add_timer(r, "tick", 0, msec(50));
    let sample = b.add_output(r, "sample");
    b.add_reaction(r, ReactionSpec::new().on_timer(tick).writes(sample));
    let mut rng = StdRng::from_entropy();
    let mut phase = 0.0f64;
    b.set_body(
        r,
        reactor_fn(move |_, ctx| {
            phase += 0.5;
            let noise: f64 = rng.gen_range(-0.2..0.2);
            ctx.set(sample, phase.sin() * 10.0 + noise);
            ReactionOutcome::Ok
        }),
    )
    .expect("sensor body");
    b.build().expect("sensor program")
}

fn filter() -> Program {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("filter");
    let sample = b.add_input(r, "sample");
    let average = b.add_output(r, "average");
    b.add_reaction(r, ReactionSpec::new().on_port(sample).writes(average));
    let mut window: VecDeque<f64> = VecDeque::with_capacity(WINDOW);
    b.set_body(
        r,
        reactor_fn(move |_, ctx| {
            if let Some(x) = ctx.get_as::<f64>(sample) {
                if window.len() == WINDOW {
                    window.pop_front();
                }
                window.push_back(x);
                let mean = window.iter().sum::<f64>() / window.len() as f64;
                ctx.set(average, mean);
            }
            ReactionOutcome::Ok
        }),
    )
    .expect("filter body");
    b.build().expect("filter program")
}

fn display() -> Program {
    let mut b = ProgramBuilder::new();
    let r = b.add_reactor("display");
    let average = b.add_input(r, "average");
    b.add_reaction(r, ReactionSpec::new().on_port(average));
    b.set_body(
        r,
        reactor_fn(move |_, ctx| {
            if let Some(mean) = ctx.get_as::<f64>(average) {
                println!(
                    "  {:>16}  average {:>7.3}  (lag {:.1} ms)",
                    ctx.tag().to_string(),
                    mean,
                    (ctx.physical_time() - ctx.logical_time()) as f64 / 1e6
                );
            }
            ReactionOutcome::Ok
        }),
    )
    .expect("display body");
    b.build().expect("display program")
}

fn program_for(id: FederateId) -> Program {
    match id {
        1 => sensor(),
        2 => filter(),
        _ => display(),
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    kairos::init_logging("warn");

    let config = RuntimeConfig::from_yaml(FEDERATION).expect("valid federation config");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind coordinator");
    let addr = listener.local_addr().expect("coordinator address");

    println!("=== Federated Pipeline ===");
    println!("Coordinator: {addr}");
    println!("Federates:   {}", config.federate_count());
    println!();

    let coordinator = Coordinator::from_config(&config).expect("coordinator");
    let server = thread::spawn(move || coordinator.serve(&listener));

    let federates: Vec<_> = config
        .federates
        .iter()
        .map(|f| {
            let id = f.id;
            let options = config.federate_options(id).expect("federate options");
            thread::Builder::new()
                .name(options.name.clone())
                .spawn(move || -> kairos::RuntimeResult<RunReport> {
                    let endpoint = Endpoint::connect(addr)?;
                    Federate::join(program_for(id), options, endpoint)?.run()
                })
                .expect("spawn federate")
        })
        .collect();

    let reports: Vec<RunReport> = federates
        .into_iter()
        .map(|h| h.join().expect("federate thread").expect("federate run"))
        .collect();
    let coordinator = server
        .join()
        .expect("coordinator thread")
        .expect("coordinator run");

    println!();
    for report in &reports {
        print!("{}", report.summary());
        println!();
    }
    println!("=== Coordinator ===");
    println!("{}", coordinator.to_csv());
}
