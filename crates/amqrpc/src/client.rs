// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC client implementation.
//!
//! [`AsyncAmqpRpc`] is the public entry point: it owns the connection
//! lifecycle, the correlation id generator, the pending-call registry and
//! the reply router, and exposes the caller/responder operations on top.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::{AmqpConfig, RpcOptions};
use crate::connection::{backoff_delay, ConnectionManager, Session};
use crate::correlation::CorrelationIdGenerator;
use crate::error::{Error, Result};
use crate::registry::CallRegistry;
use crate::router::{self, RouterContext};
use crate::server::{self, QueueBinding, RequestHandler, Subscription};
use crate::transport::{AmqpTransport, BrokerLink, BrokerTransport, Envelope};

/// Lifecycle state of an [`AsyncAmqpRpc`] client.
///
/// `call` is accepted only in `Connected`. A mid-flight connection loss
/// flips the state back to `Disconnected`; `connect` may then be called
/// again. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection; `connect` is accepted.
    Disconnected,
    /// A `connect` call is in progress.
    Connecting,
    /// Session established; calls are accepted.
    Connected,
    /// A `stop` call is in progress.
    Stopping,
    /// Stopped for good.
    Stopped,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything tied to one established session.
struct ActiveSession {
    link: Arc<dyn BrokerLink>,
    reply_queue: String,
    router: JoinHandle<()>,
    subscriptions: Vec<Subscription>,
}

/// Asynchronous RPC client over an AMQP broker.
///
/// One instance holds one logical connection, one private reply queue and
/// one reply-router task. Any number of tasks may issue calls concurrently;
/// each call suspends on its own pending-call slot, so responses arriving
/// out of order resolve the right callers.
///
/// # Example
///
/// ```rust,no_run
/// use amqrpc::{AmqpConfig, AsyncAmqpRpc};
/// use std::time::Duration;
///
/// # async fn example() -> amqrpc::Result<()> {
/// let rpc = AsyncAmqpRpc::new(AmqpConfig::for_host("localhost", 5672))?;
/// rpc.connect().await?;
///
/// let reply = rpc.call("math.add", b"[2, 2]", Duration::from_secs(5)).await?;
/// println!("sum: {}", String::from_utf8_lossy(&reply));
///
/// rpc.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct AsyncAmqpRpc {
    /// Connection descriptor (immutable).
    config: AmqpConfig,

    /// RPC-level options (immutable).
    options: RpcOptions,

    /// Broker transport; swapped for the in-process one in tests.
    transport: Arc<dyn BrokerTransport>,

    /// Correlation id generator for this client session.
    ids: CorrelationIdGenerator,

    /// Pending calls awaiting replies.
    registry: CallRegistry,

    /// Lifecycle state, shared with the router.
    state: Arc<Mutex<ClientState>>,

    /// Live session, when connected.
    session: Mutex<Option<ActiveSession>>,
}

impl AsyncAmqpRpc {
    /// Create a client with default RPC options, talking real AMQP.
    pub fn new(config: AmqpConfig) -> Result<Self> {
        Self::with_options(config, RpcOptions::default())
    }

    /// Create a client with explicit RPC options.
    pub fn with_options(config: AmqpConfig, options: RpcOptions) -> Result<Self> {
        Self::with_transport(config, options, Arc::new(AmqpTransport))
    }

    /// Create a client on a caller-supplied transport.
    ///
    /// This is how the test suite runs the full stack against
    /// [`MemoryBroker`](crate::transport::MemoryBroker).
    pub fn with_transport(
        config: AmqpConfig,
        options: RpcOptions,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self> {
        config.validate().map_err(|e| Error::Config(e.to_string()))?;
        options.validate().map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            config,
            options,
            transport,
            ids: CorrelationIdGenerator::new(),
            registry: CallRegistry::new(),
            state: Arc::new(Mutex::new(ClientState::Disconnected)),
            session: Mutex::new(None),
        })
    }

    /// Establish the connection and the reply path.
    ///
    /// Makes up to `connect_attempts` passes over the candidate hosts, with
    /// exponential capped backoff between passes. On success the reply queue
    /// is declared (and bound, when a callback exchange is configured), the
    /// reply consumer starts and the state becomes `Connected`.
    ///
    /// Idempotent while connected. Fails with [`Error::ConnectionFailed`]
    /// once every attempt is exhausted; the client does not keep retrying in
    /// the background. A `stop` racing the retry loop wins: the client stays
    /// stopped and the connect reports [`Error::Shutdown`].
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ClientState::Connected => return Ok(()),
                ClientState::Connecting => {
                    return Err(Error::InvalidState(
                        "connect already in progress".to_string(),
                    ))
                }
                ClientState::Stopping | ClientState::Stopped => {
                    return Err(Error::InvalidState(format!(
                        "cannot connect while {}",
                        state
                    )))
                }
                ClientState::Disconnected => *state = ClientState::Connecting,
            }
        }

        let manager = ConnectionManager::new(
            self.config.clone(),
            self.options.clone(),
            Arc::clone(&self.transport),
        );
        let seed = manager.backoff_seed();
        let mut last_error: Option<Error> = None;

        for attempt in 0..self.config.connect_attempts {
            if attempt > 0 {
                let delay = backoff_delay(
                    self.config.retry_delay,
                    self.config.max_retry_delay,
                    attempt - 1,
                    seed,
                );
                log::warn!(
                    "Connect attempt {}/{} failed; retrying in {:?}",
                    attempt,
                    self.config.connect_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
                if self.state() != ClientState::Connecting {
                    // stop() ran during the backoff.
                    return Err(Error::Shutdown);
                }
            }

            match manager.establish().await {
                Ok(session) => return self.install_session(session).await,
                Err(e) => last_error = Some(e),
            }
        }

        {
            let mut state = self.state.lock();
            // stop() may have raced the last attempt; leave its state alone.
            if *state != ClientState::Connecting {
                return Err(Error::Shutdown);
            }
            *state = ClientState::Disconnected;
        }
        let detail = last_error.map_or_else(
            || "no connection attempts were made".to_string(),
            |e| e.to_string(),
        );
        Err(Error::ConnectionFailed(detail))
    }

    /// Wire up a freshly established session, unless `stop` won the race.
    async fn install_session(&self, session: Session) -> Result<()> {
        let Session {
            link,
            reply_queue,
            events,
        } = session;

        let router = router::spawn(
            events,
            RouterContext {
                registry: self.registry.clone(),
                state: Arc::clone(&self.state),
                log_unrouted: self.options.log_unrouted_replies,
            },
        );

        {
            let mut state = self.state.lock();
            if *state == ClientState::Connecting {
                *state = ClientState::Connected;
                *self.session.lock() = Some(ActiveSession {
                    link,
                    reply_queue,
                    router,
                    subscriptions: Vec::new(),
                });
                log::info!("RPC client connected");
                return Ok(());
            }
        }

        // stop() ran while we were connecting; tear the session down again.
        let _ = link.close().await;
        let _ = router.await;
        Err(Error::Shutdown)
    }

    /// Issue an RPC call through the default exchange.
    ///
    /// Publishes `payload` to the queue named `routing_key` with a fresh
    /// correlation id, `reply_to` set to this client's reply queue and the
    /// per-message TTL set to `timeout`, then awaits exactly one of:
    /// the correlated reply, [`Error::Timeout`] at the deadline,
    /// [`Error::ServiceUnavailable`] on connection loss, or
    /// [`Error::Shutdown`] if the client is stopped meanwhile.
    pub async fn call(&self, routing_key: &str, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.call_exchange("", routing_key, payload, timeout).await
    }

    /// Issue an RPC call through the default exchange with the configured
    /// default timeout.
    pub async fn call_default(&self, routing_key: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.call_exchange("", routing_key, payload, self.options.default_timeout)
            .await
    }

    /// Issue an RPC call through an explicit exchange.
    pub async fn call_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (link, reply_queue) = self.current_session()?;

        let id = self.ids.next_id();
        let pending = self.registry.register(id)?;

        let ttl_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1);
        let envelope = Envelope::default()
            .with_correlation_id(id.to_string())
            .with_reply_to(reply_queue)
            .with_expiration_ms(ttl_ms);

        log::debug!("Call {} -> '{}' via '{}'", id, routing_key, exchange);

        if let Err(e) = link.publish(exchange, routing_key, &envelope, payload).await {
            // Dropping the pending call removes its registry entry.
            drop(pending);
            return Err(Error::unavailable(format!("publish failed: {}", e)));
        }

        pending.wait(timeout).await
    }

    /// Fire-and-forget send through the default exchange.
    ///
    /// No correlation id is registered and no reply is awaited; responders
    /// see a request without `reply_to` and stay silent.
    pub async fn cast(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.cast_exchange("", routing_key, payload).await
    }

    /// Fire-and-forget send through an explicit exchange.
    pub async fn cast_exchange(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let (link, _) = self.current_session()?;
        link.publish(exchange, routing_key, &Envelope::default(), payload)
            .await
            .map_err(|e| Error::unavailable(format!("publish failed: {}", e)))
    }

    /// Serve requests from a queue with `handler`.
    ///
    /// Declares (and optionally binds) the queue, starts a consumer and
    /// dispatches every delivery to the handler on its own task. Replies go
    /// to the request's `reply_to` through `RpcOptions::reply_exchange`,
    /// carrying the request's correlation id.
    ///
    /// Subscriptions live and die with the session: after a connection loss
    /// and a fresh `connect`, subscribe again.
    pub async fn subscribe<H: RequestHandler>(&self, binding: QueueBinding, handler: H) -> Result<()> {
        let (link, _) = self.current_session()?;

        let queue = link.declare_queue(&binding.queue, binding.durable).await?;
        if let Some(exchange) = &binding.exchange {
            let routing_key = binding.routing_key.as_deref().unwrap_or(&binding.queue);
            link.bind_queue(&queue, exchange, routing_key).await?;
        }

        let consumer_tag = format!("amqrpc.sub.{}", queue);
        let events = link.consume(&queue, &consumer_tag).await?;
        let task = server::spawn_dispatcher(
            events,
            Arc::clone(&link),
            self.options.reply_exchange.clone(),
            Arc::new(handler),
            queue.clone(),
        );

        log::info!("Serving requests from '{}'", queue);

        let mut session = self.session.lock();
        match session.as_mut() {
            Some(active) => active.subscriptions.push(Subscription { queue, task }),
            None => {
                // Connection lost while setting up; the dispatcher exits on
                // its own once it sees the closed consumer.
                log::debug!("Subscription on '{}' raced a disconnect", queue);
            }
        }
        Ok(())
    }

    /// Stop the client.
    ///
    /// Fails every pending call with [`Error::Shutdown`], closes the
    /// connection and waits for the router and subscription dispatchers to
    /// finish. Idempotent; repeated calls are no-ops.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ClientState::Stopping | ClientState::Stopped => return,
                _ => *state = ClientState::Stopping,
            }
        }

        let failed = self.registry.fail_all(&Error::Shutdown);
        if failed > 0 {
            log::info!("Stopping with {} pending calls; all failed with Shutdown", failed);
        }

        let session = self.session.lock().take();
        if let Some(session) = session {
            let ActiveSession {
                link,
                router,
                subscriptions,
                ..
            } = session;
            let _ = link.close().await;
            let _ = router.await;
            for sub in subscriptions {
                let _ = sub.task.await;
                log::debug!("Subscription on '{}' finished", sub.queue);
            }
        }

        *self.state.lock() = ClientState::Stopped;
        log::info!("RPC client stopped");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Number of calls currently awaiting replies.
    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    /// Name of the private reply queue, when connected.
    pub fn reply_queue(&self) -> Option<String> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.reply_queue.clone())
    }

    /// Link and reply queue of the live session, or `InvalidState`.
    fn current_session(&self) -> Result<(Arc<dyn BrokerLink>, String)> {
        let state = *self.state.lock();
        if state != ClientState::Connected {
            return Err(Error::InvalidState(format!("cannot call while {}", state)));
        }
        let session = self.session.lock();
        match session.as_ref() {
            Some(active) => Ok((Arc::clone(&active.link), active.reply_queue.clone())),
            None => Err(Error::InvalidState("no active session".to_string())),
        }
    }
}

impl Drop for AsyncAmqpRpc {
    fn drop(&mut self) {
        if *self.state.lock() == ClientState::Stopped {
            return;
        }
        // Best effort only; call stop() for an orderly shutdown.
        self.registry.fail_all(&Error::Shutdown);
        if let Some(session) = self.session.lock().take() {
            session.router.abort();
            for sub in session.subscriptions {
                sub.task.abort();
            }
            // Transport consumer tasks park until the link closes; hand the
            // close to the runtime when one is still around.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let link = session.link;
                handle.spawn(async move {
                    let _ = link.close().await;
                });
            }
        }
        *self.state.lock() = ClientState::Stopped;
    }
}

impl std::fmt::Debug for AsyncAmqpRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncAmqpRpc")
            .field("state", &*self.state.lock())
            .field("pending_calls", &self.registry.len())
            .finish()
    }
}
