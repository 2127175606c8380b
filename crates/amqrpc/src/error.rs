// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for AMQP RPC operations.

use std::fmt;

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the RPC engine.
///
/// Connectivity failures (`ConnectionFailed`, `ServiceUnavailable`) are kept
/// distinct from `Timeout` (a reachable broker that simply never answered) so
/// callers can tell a dead broker from a slow responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Initial connect failed after exhausting all candidate hosts and
    /// retry attempts. The engine does not keep retrying on its own.
    ConnectionFailed(String),

    /// Connection lost while calls were outstanding, or the broker rejected
    /// a publish mid-call. Pending calls fail immediately with this; new
    /// calls are rejected until the next successful `connect`.
    ServiceUnavailable(String),

    /// No response within the caller-specified deadline. Local to the one
    /// call; sibling calls are unaffected.
    Timeout,

    /// Pending call failed because the client was stopped.
    Shutdown,

    /// A correlation identifier was already registered. Defensive check:
    /// cannot happen with the built-in generator, surfaced rather than
    /// silently overwriting an unrelated in-flight call.
    DuplicateCorrelationId(String),

    /// Operation attempted outside the state that accepts it (e.g. `call`
    /// before `connect` or after `stop`).
    InvalidState(String),

    /// Configuration rejected during client construction.
    Config(String),

    /// Queue or exchange declaration/binding failed.
    DeclareFailed(String),

    /// Publish failed because the channel or connection is not usable.
    PublishFailed(String),
}

impl Error {
    /// Shorthand for `ServiceUnavailable` with context.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// True for the connectivity-loss failures that should fail every
    /// pending call at once.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ServiceUnavailable(_) | Self::Shutdown
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            Self::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            Self::Timeout => write!(f, "RPC request timed out"),
            Self::Shutdown => write!(f, "RPC client stopped"),
            Self::DuplicateCorrelationId(id) => {
                write!(f, "Duplicate correlation id: {}", id)
            }
            Self::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Self::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::DeclareFailed(msg) => write!(f, "Declare failed: {}", msg),
            Self::PublishFailed(msg) => write!(f, "Publish failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
