// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker transport abstraction.
//!
//! The RPC layer never talks wire protocol directly; it drives a
//! [`BrokerLink`] obtained from a [`BrokerTransport`]. Two implementations
//! ship with the crate:
//!
//! - [`AmqpTransport`] — real AMQP 0-9-1 via `lapin` (the default)
//! - [`MemoryTransport`] — an in-process broker for hermetic tests
//!
//! Deliveries flow to consumers through a bounded event channel, one pump
//! task per consumer, so slow handlers exert backpressure instead of
//! growing an unbounded queue.

pub mod amqp;
pub mod mem;

pub use amqp::AmqpTransport;
pub use mem::{MemoryBroker, MemoryTransport};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::AmqpConfig;
use crate::error::Result;

/// Consumer event channel capacity (provides backpressure instead of OOM).
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Outbound message metadata.
///
/// Maps onto AMQP basic properties; the memory transport carries it as-is.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Correlation id echoed back by the responder.
    pub correlation_id: Option<String>,
    /// Queue the responder should publish the reply to.
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds; the broker drops the message once
    /// it expires unconsumed.
    pub expiration_ms: Option<u64>,
}

impl Envelope {
    /// Builder: set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Builder: set the reply queue.
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Builder: set the per-message TTL.
    pub fn with_expiration_ms(mut self, ttl_ms: u64) -> Self {
        self.expiration_ms = Some(ttl_ms);
        self
    }
}

/// One message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Correlation id property, if the publisher set one.
    pub correlation_id: Option<String>,
    /// Reply queue property, if the publisher set one.
    pub reply_to: Option<String>,
    /// Message body.
    pub payload: Vec<u8>,
}

/// Events flowing from a consumer pump to its subscriber.
///
/// `Closed` is terminal: the pump exits after sending it and the channel
/// ends.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// A message arrived on the consumed queue.
    Delivery(InboundMessage),
    /// The consumer stopped on its own (connection lost, queue deleted).
    Closed {
        /// Human-readable cause, for logs.
        reason: String,
    },
}

/// Factory for broker connections.
///
/// `open` dials exactly one candidate endpoint; candidate iteration and
/// retry policy live above this trait, in the connection manager.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a link to `host:port` using the credentials in `config`.
    async fn open(&self, host: &str, port: u16, config: &AmqpConfig) -> Result<Box<dyn BrokerLink>>;
}

/// One live connection to a broker.
///
/// All methods are usable concurrently from multiple tasks. After the
/// underlying connection dies every method fails and `is_open` returns
/// `false`; consumers learn of the death through [`ConsumerEvent::Closed`].
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Declare the exclusive, auto-delete reply queue for this link and
    /// return its broker-generated name.
    async fn declare_reply_queue(&self) -> Result<String>;

    /// Declare a named queue (idempotent) and return its name.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<String>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start consuming `queue`; deliveries arrive on the returned channel.
    ///
    /// The consumer acknowledges each delivery on receipt, before it is
    /// handed to the channel.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<ConsumerEvent>>;

    /// Publish `payload` to `exchange` under `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        payload: &[u8],
    ) -> Result<()>;

    /// Close the link. Idempotent; consumers see their channels end.
    async fn close(&self) -> Result<()>;

    /// Whether the underlying connection is still alive.
    fn is_open(&self) -> bool;
}

impl std::fmt::Debug for dyn BrokerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerLink")
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}
