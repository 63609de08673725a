//! Error types shared by the scheduler and the federation layer.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::federated::message::WireError;
use crate::tag::Tag;
use crate::types::{FederateId, Interval};

/// Errors raised while assembling a [`Program`](crate::graph::Program).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("reactor '{0}' has no body")]
    MissingBody(String),

    #[error("unknown {kind} id {id}")]
    UnknownId { kind: &'static str, id: usize },

    #[error("causality cycle through: {}", .0.join(", "))]
    CausalityCycle(Vec<String>),

    #[error("connection {connection} has negative delay {delay}")]
    NegativeDelay { connection: usize, delay: Interval },

    #[error("connection {connection}: {reason}")]
    InvalidConnection { connection: usize, reason: String },

    #[error("port '{0}' not found")]
    UnknownPort(String),
}

/// Errors raised while executing reactions or coordinating federates.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Something was scheduled or received at a tag that is not in the future.
    #[error("time order violation: {attempted} is not after {current}")]
    TimeOrderViolation { attempted: Tag, current: Tag },

    /// A link dropped without a prior resign.
    #[error("transport failure on link to {peer}: {reason}")]
    TransportFailure { peer: String, reason: String },

    /// No grant arrived within the configured bound.
    #[error("no grant for {tag} after {waited:?}")]
    GrantTimeout { tag: Tag, waited: Duration },

    /// A reaction body reported a fatal outcome.
    #[error("reaction {reactor}[{reaction}] failed at {tag}: {reason}")]
    ReactionFault {
        reactor: String,
        reaction: usize,
        tag: Tag,
        reason: String,
    },

    /// A reaction wrote a port or scheduled an action it did not declare.
    #[error("reaction {reactor}[{reaction}] has no declared effect on {target}")]
    UndeclaredEffect {
        reactor: String,
        reaction: usize,
        target: String,
    },

    /// The coordinator aborted the federation.
    #[error("federation aborted (origin federate {origin}): {reason}")]
    Aborted { origin: FederateId, reason: String },

    /// A peer sent a message that is invalid in the current protocol state.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    /// Whether this error ends the whole federation rather than one federate.
    pub fn is_fatal_to_federation(&self) -> bool {
        matches!(
            self,
            RuntimeError::TransportFailure { .. } | RuntimeError::Aborted { .. }
        )
    }
}
