// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process broker for hermetic tests.
//!
//! Implements the [`BrokerLink`] contract over plain task-local state: named
//! queues with FIFO buffers, direct-exchange bindings, per-message TTL and a
//! connection-loss switch. No sockets, no broker daemon; the full RPC stack
//! runs against it unchanged.
//!
//! ```text
//! MemoryBroker (cloneable handle)
//! +-- BrokerState
//!     +-- queues: Mutex<HashMap<name, QueueState>>   FIFO buffer + notify
//!     +-- bindings: Mutex<Vec<Binding>>              (exchange, key) -> queue
//!     +-- links: Mutex<Vec<Weak<AtomicBool>>>        per-link open flags
//!     +-- down: AtomicBool                           refuse new opens
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::{BrokerLink, BrokerTransport, ConsumerEvent, Envelope, InboundMessage,
    EVENT_CHANNEL_CAPACITY};
use crate::config::AmqpConfig;
use crate::error::{Error, Result};

/// Message parked in a queue until a consumer drains it.
struct StoredMessage {
    message: InboundMessage,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

/// Direct-exchange binding: (exchange, routing key) routes to one queue.
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    bindings: Mutex<Vec<Binding>>,
    links: Mutex<Vec<Weak<AtomicBool>>>,
    down: AtomicBool,
    failed_hosts: Mutex<HashSet<String>>,
    next_queue_id: AtomicU64,
    next_link_id: AtomicU64,
}

impl BrokerState {
    fn wake_all_queues(&self) {
        let queues = self.queues.lock();
        for queue in queues.values() {
            queue.notify.notify_one();
        }
    }
}

/// Handle to an in-process broker.
///
/// Clones share one broker. Obtain a [`MemoryTransport`] via
/// [`transport`](MemoryBroker::transport) and hand it to the client under
/// test; the fault hooks ([`set_down`](MemoryBroker::set_down),
/// [`sever`](MemoryBroker::sever), [`fail_host`](MemoryBroker::fail_host))
/// drive the failure scenarios a live broker makes awkward to reproduce.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: Mutex::new(HashMap::new()),
                bindings: Mutex::new(Vec::new()),
                links: Mutex::new(Vec::new()),
                down: AtomicBool::new(false),
                failed_hosts: Mutex::new(HashSet::new()),
                next_queue_id: AtomicU64::new(1),
                next_link_id: AtomicU64::new(1),
            }),
        }
    }

    /// Transport factory connecting to this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            state: Arc::clone(&self.state),
        }
    }

    /// Refuse (or accept again) new connection attempts.
    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::Relaxed);
    }

    /// Refuse connection attempts to one candidate host.
    pub fn fail_host(&self, host: impl Into<String>) {
        self.state.failed_hosts.lock().insert(host.into());
    }

    /// Accept connection attempts to `host` again.
    pub fn restore_host(&self, host: &str) {
        self.state.failed_hosts.lock().remove(host);
    }

    /// Kill every open link, as if the broker dropped all connections.
    ///
    /// Consumers observe [`ConsumerEvent::Closed`]; subsequent publishes on
    /// the dead links fail. New connections are still accepted unless
    /// [`set_down`](MemoryBroker::set_down) was called.
    pub fn sever(&self) {
        let mut links = self.state.links.lock();
        for link in links.drain(..) {
            if let Some(open) = link.upgrade() {
                open.store(false, Ordering::Relaxed);
            }
        }
        drop(links);
        self.state.wake_all_queues();
        log::debug!("[MEM] Severed all links");
    }

    /// Number of messages parked in `queue` (0 if it does not exist).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Number of links currently open; closed and severed ones are excluded.
    pub fn open_links(&self) -> usize {
        self.state
            .links
            .lock()
            .iter()
            .filter(|link| {
                link.upgrade()
                    .is_some_and(|open| open.load(Ordering::Relaxed))
            })
            .count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport factory for a [`MemoryBroker`].
pub struct MemoryTransport {
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn open(&self, host: &str, port: u16, _config: &AmqpConfig) -> Result<Box<dyn BrokerLink>> {
        if self.state.down.load(Ordering::Relaxed) {
            return Err(Error::ConnectionFailed(format!(
                "{}:{}: broker down",
                host, port
            )));
        }
        if self.state.failed_hosts.lock().contains(host) {
            return Err(Error::ConnectionFailed(format!(
                "{}:{}: connection refused",
                host, port
            )));
        }

        let open = Arc::new(AtomicBool::new(true));
        self.state.links.lock().push(Arc::downgrade(&open));
        let id = self.state.next_link_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("[MEM] Link {} opened to {}:{}", id, host, port);

        Ok(Box::new(MemoryLink {
            broker: Arc::clone(&self.state),
            open,
            id,
        }))
    }
}

/// One in-process connection.
pub struct MemoryLink {
    broker: Arc<BrokerState>,
    open: Arc<AtomicBool>,
    id: u64,
}

impl MemoryLink {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::PublishFailed("connection closed".to_string()))
        }
    }

    fn create_queue(&self, name: &str) {
        let mut queues = self.broker.queues.lock();
        queues.entry(name.to_string()).or_default();
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn declare_reply_queue(&self) -> Result<String> {
        self.ensure_open()
            .map_err(|_| Error::DeclareFailed("connection closed".to_string()))?;
        let id = self.broker.next_queue_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("amq.gen-{:08x}", id);
        self.create_queue(&name);
        Ok(name)
    }

    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<String> {
        self.ensure_open()
            .map_err(|_| Error::DeclareFailed("connection closed".to_string()))?;
        self.create_queue(name);
        Ok(name.to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()
            .map_err(|_| Error::DeclareFailed("connection closed".to_string()))?;
        let mut bindings = self.broker.bindings.lock();
        let exists = bindings.iter().any(|b| {
            b.exchange == exchange && b.routing_key == routing_key && b.queue == queue
        });
        if !exists {
            bindings.push(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<mpsc::Receiver<ConsumerEvent>> {
        self.ensure_open()
            .map_err(|_| Error::DeclareFailed("connection closed".to_string()))?;
        self.create_queue(queue);

        let notify = {
            let queues = self.broker.queues.lock();
            // Present: create_queue just inserted it.
            Arc::clone(&queues[queue].notify)
        };

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let broker = Arc::clone(&self.broker);
        let link_open = Arc::clone(&self.open);
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            loop {
                if !link_open.load(Ordering::Relaxed) {
                    let _ = event_tx
                        .send(ConsumerEvent::Closed {
                            reason: "connection closed".to_string(),
                        })
                        .await;
                    return;
                }

                let next = {
                    let mut queues = broker.queues.lock();
                    queues
                        .get_mut(&queue_name)
                        .and_then(|q| q.messages.pop_front())
                };

                match next {
                    Some(stored) if stored.expired(Instant::now()) => continue,
                    Some(stored) => {
                        if event_tx
                            .send(ConsumerEvent::Delivery(stored.message))
                            .await
                            .is_err()
                        {
                            // Subscriber dropped its receiver.
                            return;
                        }
                    }
                    None => notify.notified().await,
                }
            }
        });

        Ok(event_rx)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        payload: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;

        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: the routing key is the queue name.
            vec![routing_key.to_string()]
        } else {
            self.broker
                .bindings
                .lock()
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        if targets.is_empty() {
            log::debug!(
                "[MEM] Unroutable publish to '{}' via '{}'",
                routing_key,
                exchange
            );
            return Ok(());
        }

        let expires_at = envelope
            .expiration_ms
            .map(|ttl| Instant::now() + Duration::from_millis(ttl));

        let mut queues = self.broker.queues.lock();
        for target in targets {
            let Some(queue) = queues.get_mut(&target) else {
                log::debug!("[MEM] Publish to missing queue '{}'", target);
                continue;
            };
            queue.messages.push_back(StoredMessage {
                message: InboundMessage {
                    routing_key: routing_key.to_string(),
                    correlation_id: envelope.correlation_id.clone(),
                    reply_to: envelope.reply_to.clone(),
                    payload: payload.to_vec(),
                },
                expires_at,
            });
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::Relaxed) {
            self.broker.wake_all_queues();
            log::debug!("[MEM] Link {} closed", self.id);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}
