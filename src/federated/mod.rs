//! Federated execution.
//!
//! A federation is a set of programs, each run by its own [`Federate`],
//! connected through a central [`Coordinator`]. Every message between
//! federates is relayed by the coordinator, which also decides how far each
//! federate may advance logical time.
//!
//! The protocol, per federate:
//!
//! 1. `HELLO` → `NEIGHBORS` (its connection table) → `START` (start epoch).
//! 2. Before a tag: `NET(tag)`, then wait for `TAG(g)` with `g >= tag`, or
//!    for `PTAG(tag)` when the federate sits in a zero-delay cycle.
//! 3. While processing: `TAGGED_MESSAGE` / `PORT_ABSENT` per network output.
//! 4. After a tag: `LTC(tag)`.
//! 5. On a stop request: `STOP_REQUEST` → every other federate replies with
//!    `STOP_REPLY` → the coordinator broadcasts `STOP(max)`.
//! 6. At the end: `RESIGN`, or `FAILED` after a local error.
//!
//! Wire frames are described in [`message`]; links in [`transport`].

pub mod coordinator;
pub mod federate;
pub mod message;
pub mod topology;
pub mod transport;

pub use coordinator::Coordinator;
pub use federate::{Federate, FederateOptions};
pub use message::{Message, MessageKind, WireError};
pub use topology::{ConnectionEntry, Topology};
pub use transport::{memory_pair, Endpoint, FrameReader, FrameWriter};
