// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Responder role: request handlers and subscription dispatch.
//!
//! A subscription consumes one queue and runs every delivery through a
//! [`RequestHandler`]. Handlers run on their own tasks, so one slow request
//! does not hold up the queue. When the handler yields a payload and the
//! request carries a `reply_to`, the reply is published back with the
//! request's correlation id echoed verbatim.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::{BrokerLink, ConsumerEvent, Envelope, InboundMessage};

/// Handler trait for processing incoming requests.
///
/// Implement this trait to define your service logic, or use any
/// `Fn(Request) -> impl Future<Output = Option<Vec<u8>>>` closure directly.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a request.
    ///
    /// Return `Some(payload)` to reply, `None` to stay silent (the caller,
    /// if any, will time out or was not expecting an answer to begin with).
    async fn handle(&self, request: Request) -> Option<Vec<u8>>;
}

/// A function-based request handler.
#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Vec<u8>>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Option<Vec<u8>> {
        self(request).await
    }
}

/// One incoming request, as seen by a handler.
#[derive(Debug, Clone)]
pub struct Request {
    /// Routing key the request was published with.
    pub routing_key: String,
    /// Correlation id to echo in the reply; `None` for anonymous sends.
    pub correlation_id: Option<String>,
    /// Queue the caller expects the reply on; `None` for fire-and-forget.
    pub reply_to: Option<String>,
    /// Request body.
    pub payload: Vec<u8>,
}

impl From<InboundMessage> for Request {
    fn from(message: InboundMessage) -> Self {
        Self {
            routing_key: message.routing_key,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            payload: message.payload,
        }
    }
}

/// Where a subscription consumes from.
///
/// Plain form consumes a named queue fed through the default exchange;
/// `with_exchange` additionally binds the queue, with the routing key
/// defaulting to the queue name.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    /// Queue to declare and consume.
    pub queue: String,
    /// Exchange to bind the queue to, if any.
    pub exchange: Option<String>,
    /// Binding key; defaults to the queue name when an exchange is set.
    pub routing_key: Option<String>,
    /// Declare the queue durable.
    pub durable: bool,
}

impl QueueBinding {
    /// Consume `queue` via the default exchange.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: None,
            routing_key: None,
            durable: false,
        }
    }

    /// Builder: bind the queue to `exchange`.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Builder: bind under `routing_key` instead of the queue name.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Builder: declare the queue durable.
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

/// A live subscription, tracked by the client for teardown.
pub(crate) struct Subscription {
    pub queue: String,
    pub task: JoinHandle<()>,
}

/// Spawn the dispatch loop for one subscription.
///
/// Ends when the consumer closes (connection lost or link shut down).
/// Handlers already running at that point finish in the background; replies
/// they produce fail to publish once the link is gone.
pub(crate) fn spawn_dispatcher(
    mut events: mpsc::Receiver<ConsumerEvent>,
    link: Arc<dyn BrokerLink>,
    reply_exchange: String,
    handler: Arc<dyn RequestHandler>,
    queue: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConsumerEvent::Delivery(message) => {
                    let link = Arc::clone(&link);
                    let handler = Arc::clone(&handler);
                    let reply_exchange = reply_exchange.clone();
                    tokio::spawn(async move {
                        dispatch(link, reply_exchange, handler, Request::from(message)).await;
                    });
                }
                ConsumerEvent::Closed { reason } => {
                    log::debug!("Subscription on '{}' closed ({})", queue, reason);
                    return;
                }
            }
        }
        log::debug!("Subscription on '{}' ended", queue);
    })
}

async fn dispatch(
    link: Arc<dyn BrokerLink>,
    reply_exchange: String,
    handler: Arc<dyn RequestHandler>,
    request: Request,
) {
    let routing_key = request.routing_key.clone();
    let correlation_id = request.correlation_id.clone();
    let reply_to = request.reply_to.clone();

    let reply = handler.handle(request).await;

    match (reply, reply_to) {
        (Some(payload), Some(reply_to)) => {
            let envelope = match correlation_id {
                Some(id) => Envelope::default().with_correlation_id(id),
                None => Envelope::default(),
            };
            if let Err(e) = link.publish(&reply_exchange, &reply_to, &envelope, &payload).await {
                log::warn!("Failed to publish reply for '{}': {}", routing_key, e);
            }
        }
        (Some(_), None) => {
            log::debug!(
                "Handler for '{}' produced a reply but the request has no reply_to; dropping",
                routing_key
            );
        }
        (None, _) => {}
    }
}
