//! Error taxonomy for the observation engine

use thiserror::Error;

/// Errors surfaced by node sources and metric derivation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObserverError {
    /// A remote call failed (network, auth, server error)
    #[error("transport error: {0}")]
    Transport(String),

    /// An optimistic update collided with a newer version of the node
    #[error("conflict updating node {name}: stale version")]
    Conflict { name: String },

    /// A node snapshot is malformed for the metric being derived
    #[error("cannot derive metrics for node {name}: {reason}")]
    Computation { name: String, reason: String },

    /// The event subscription closed
    #[error("event subscription closed")]
    StreamClosed,
}

impl ObserverError {
    pub fn computation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Computation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Short label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            ObserverError::Transport(_) => "transport",
            ObserverError::Conflict { .. } => "conflict",
            ObserverError::Computation { .. } => "computation",
            ObserverError::StreamClosed => "stream_closed",
        }
    }
}

pub type Result<T> = std::result::Result<T, ObserverError>;
