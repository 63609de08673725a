//! # Kairos
//!
//! A deterministic reactor runtime with federated logical-time coordination.
//!
//! ## Design Principles
//!
//! - **Logical Time**: Every event carries a [`Tag`] (time plus microstep).
//!   Tags are processed in strict order, and all reactions at one tag see
//!   the same port values.
//! - **Determinism**: Reactions at one tag run level by level; writes are
//!   committed in reaction order, so a program produces the same trace no
//!   matter how many workers run it.
//! - **Federation**: Programs can be split across processes. A central
//!   coordinator grants time advances so no federate ever sees a message
//!   from its past.
//!
//! ## Features
//!
//! - `parallel` - Run independent reactions of a level on a rayon pool
//!
//! ## Quick Start
//!
//! ```rust
//! use kairos::graph::ProgramBuilder;
//! use kairos::reaction::{reactor_fn, ReactionOutcome, ReactionSpec};
//! use kairos::{LocalScheduler, SchedulerOptions};
//! use kairos::types::msec;
//! use serde_json::json;
//!
//! let mut b = ProgramBuilder::new();
//! let counter = b.add_reactor("counter");
//! let tick = b.add_timer(counter, "tick", 0, msec(1));
//! let out = b.add_output(counter, "count");
//! b.add_reaction(counter, ReactionSpec::new().on_timer(tick).writes(out));
//!
//! let mut n = 0;
//! b.set_body(counter, reactor_fn(move |_, ctx| {
//!     n += 1;
//!     ctx.set(out, json!(n));
//!     ReactionOutcome::Ok
//! })).unwrap();
//!
//! let options = SchedulerOptions::default().with_fast(true).with_timeout(msec(9));
//! let mut scheduler = LocalScheduler::new(b.build().unwrap(), options);
//! let report = scheduler.run().unwrap();
//! assert_eq!(report.scheduler.reactions_fired, 10);
//! ```
//!
//! ## Federated Execution
//!
//! ```rust,ignore
//! use kairos::config::RuntimeConfig;
//! use kairos::federated::{Coordinator, Endpoint, Federate};
//!
//! let config = RuntimeConfig::from_yaml_file("federation.yaml")?;
//! let coordinator = Coordinator::from_config(&config)?;
//! // in each federate process:
//! let federate = Federate::join(program, config.federate_options(1)?, Endpoint::connect(addr)?)?;
//! let report = federate.run()?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod federated;
pub mod graph;
pub mod mixed_radix;
pub mod port;
pub mod queue;
pub mod reaction;
pub mod scheduler;
pub mod stats;
pub mod tag;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use config::{ConfigError, CoordinationMode, RuntimeConfig, RuntimeConfigBuilder};
pub use error::{GraphError, RuntimeError, RuntimeResult};
pub use event::{Event, Trigger, TriggerSource};
pub use federated::{Coordinator, Federate, FederateOptions};
pub use graph::{Program, ProgramBuilder};
pub use port::{PortRef, Value};
pub use reaction::{reactor_fn, ReactionContext, ReactionOutcome, ReactionSpec, Reactor};
pub use scheduler::{LocalScheduler, PhysicalActionHandle, SchedulerOptions, SchedulerState};
pub use stats::{CoordinatorReport, RunReport, Timer};
pub use tag::Tag;
pub use types::{msec, sec, usec, FederateId, Instant, Interval};

/// Initialize the tracing subscriber for logging.
///
/// Call this at the start of your program to enable logging. `RUST_LOG`
/// overrides `level` when set.
///
/// # Example
///
/// ```rust,ignore
/// kairos::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .init();
}
