// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # amqrpc - Asynchronous AMQP RPC
//!
//! An RPC layer on top of an AMQP 0-9-1 broker: publish a request to a named
//! queue or exchange, suspend on a correlated reply, without blocking the
//! connection or other concurrent callers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use amqrpc::{AmqpConfig, AsyncAmqpRpc};
//! use std::time::Duration;
//!
//! # async fn example() -> amqrpc::Result<()> {
//! let rpc = AsyncAmqpRpc::new(AmqpConfig::for_host("localhost", 5672))?;
//! rpc.connect().await?;
//!
//! let reply = rpc.call("math.add", b"[2, 2]", Duration::from_secs(5)).await?;
//!
//! rpc.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      AsyncAmqpRpc (client)                   |
//! |   call/cast/subscribe | state machine | correlation ids      |
//! +--------------------------------------------------------------+
//! |  CallRegistry (pending calls)  |  Reply Router (one task)    |
//! +--------------------------------------------------------------+
//! |              ConnectionManager (candidates, backoff)         |
//! +--------------------------------------------------------------+
//! |    BrokerTransport/BrokerLink: AmqpTransport | MemoryBroker  |
//! +--------------------------------------------------------------+
//! ```
//!
//! Every call registers a fresh correlation id in the registry and publishes
//! with `reply_to` pointing at the client's private reply queue. The router
//! consumes that queue and resolves each reply against the registry, so
//! replies arriving out of order still wake the right callers. Timeouts,
//! cancellation, connection loss and shutdown all resolve a pending call
//! exactly once.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`AsyncAmqpRpc`] | RPC client: `connect`, `call`, `cast`, `subscribe`, `stop` |
//! | [`AmqpConfig`] | Connection descriptor (candidate hosts, credentials, retry bounds) |
//! | [`RpcOptions`] | Callback exchange, default timeout, unrouted-reply logging |
//! | [`RequestHandler`] | Responder-side request handler trait |
//! | [`Error`] | Failure taxonomy (`Timeout` vs `ServiceUnavailable` vs the rest) |

/// RPC client (`AsyncAmqpRpc`) and its lifecycle state machine.
pub mod client;
/// Connection descriptor and RPC options.
pub mod config;
/// Connection establishment (candidate iteration, backoff).
pub(crate) mod connection;
/// Correlation identifiers and their generator.
pub mod correlation;
/// Error and result types.
pub mod error;
/// Pending-call registry (correlation id -> reply slot).
pub mod registry;
/// Reply router task.
pub(crate) mod router;
/// Responder role (handlers, queue bindings, dispatch).
pub mod server;
/// Broker transports (lapin-backed AMQP, in-process memory broker).
pub mod transport;

pub use client::{AsyncAmqpRpc, ClientState};
pub use config::{AmqpConfig, RpcOptions};
pub use correlation::{CorrelationId, CorrelationIdGenerator};
pub use error::{Error, Result};
pub use registry::{CallRegistry, PendingCall};
pub use server::{QueueBinding, Request, RequestHandler};
pub use transport::{
    AmqpTransport, BrokerLink, BrokerTransport, ConsumerEvent, Envelope, InboundMessage,
    MemoryBroker, MemoryTransport,
};

/// Crate version string.
pub const VERSION: &str = "1.1.0";

#[cfg(test)]
mod tests {
    #[test]
    fn version_matches_manifest() {
        assert_eq!(super::VERSION, env!("CARGO_PKG_VERSION"));
    }
}
