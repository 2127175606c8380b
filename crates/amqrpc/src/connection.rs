// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection establishment: candidate iteration and backoff policy.
//!
//! One `establish` call makes a single pass over the configured candidate
//! endpoints in order and stops at the first one that yields a working
//! session (link + reply queue + consumer). Pass-level retries and the
//! delays between them belong to the caller; [`backoff_delay`] computes the
//! schedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{AmqpConfig, RpcOptions};
use crate::error::{Error, Result};
use crate::transport::{BrokerLink, BrokerTransport, ConsumerEvent};

/// Consumer tag for the reply-queue consumer.
const REPLY_CONSUMER_TAG: &str = "amqrpc.reply";

/// A fully set-up connection: link, private reply queue, reply consumer.
#[derive(Debug)]
pub(crate) struct Session {
    pub link: Arc<dyn BrokerLink>,
    pub reply_queue: String,
    pub events: mpsc::Receiver<ConsumerEvent>,
}

/// Dials candidates and prepares sessions. Owns no live state itself.
pub(crate) struct ConnectionManager {
    config: AmqpConfig,
    options: RpcOptions,
    transport: Arc<dyn BrokerTransport>,
}

impl ConnectionManager {
    pub fn new(config: AmqpConfig, options: RpcOptions, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            config,
            options,
            transport,
        }
    }

    /// Jitter seed for the backoff schedule, derived from the candidate set.
    pub fn backoff_seed(&self) -> u16 {
        self.config.hosts.first().map_or(0, |(_, port)| *port)
    }

    /// One pass over the candidates, in configuration order.
    ///
    /// Per-candidate failures (refused, unreachable, handshake timeout) move
    /// on to the next candidate. A failure while setting up the reply path
    /// on an established link aborts the pass instead: the link is torn down
    /// and the error surfaces, since the next candidate would hit the same
    /// configuration problem.
    pub async fn establish(&self) -> Result<Session> {
        let mut last_error = None;

        for (host, port) in &self.config.hosts {
            let attempt = self.transport.open(host, *port, &self.config);
            match tokio::time::timeout(self.config.connect_timeout, attempt).await {
                Ok(Ok(link)) => {
                    log::info!("[CONN] Connected to {}:{}", host, port);
                    return self.setup(Arc::from(link)).await;
                }
                Ok(Err(e)) => {
                    log::warn!("[CONN] Candidate {}:{} failed: {}", host, port, e);
                    last_error = Some(e);
                }
                Err(_) => {
                    log::warn!(
                        "[CONN] Candidate {}:{} timed out after {:?}",
                        host,
                        port,
                        self.config.connect_timeout
                    );
                    last_error = Some(Error::ConnectionFailed(format!(
                        "{}:{}: connect timed out",
                        host, port
                    )));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::ConnectionFailed("no candidate endpoints".to_string())))
    }

    /// Declare the reply queue, bind it when a callback exchange is
    /// configured, and start the reply consumer.
    async fn setup(&self, link: Arc<dyn BrokerLink>) -> Result<Session> {
        let reply_queue = match link.declare_reply_queue().await {
            Ok(name) => name,
            Err(e) => {
                let _ = link.close().await;
                return Err(e);
            }
        };

        if let Some(exchange) = &self.options.callback_exchange {
            // Bound under the queue's own name: responders publish replies
            // with routing key = reply_to and they land here.
            if let Err(e) = link.bind_queue(&reply_queue, exchange, &reply_queue).await {
                let _ = link.close().await;
                return Err(e);
            }
        }

        let events = match link.consume(&reply_queue, REPLY_CONSUMER_TAG).await {
            Ok(events) => events,
            Err(e) => {
                let _ = link.close().await;
                return Err(e);
            }
        };

        log::debug!("[CONN] Session ready, reply queue '{}'", reply_queue);
        Ok(Session {
            link,
            reply_queue,
            events,
        })
    }
}

/// Backoff before retry pass `attempt` (0-based), with deterministic jitter.
///
/// - delay = min(base * 2^attempt, max)
/// - jitter_pct = (attempt * 7 + seed) % 50, centered by subtracting 25
/// - final = delay + delay * (jitter_pct - 25) / 100
pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: u32, seed: u16) -> Duration {
    // 2^attempt with overflow protection
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

    let jitter_pct = ((attempt.wrapping_mul(7)).wrapping_add(u32::from(seed)) % 50) as i64;
    let jitter_offset = (delay_ms as i64 * (jitter_pct - 25)) / 100;

    let final_ms = (delay_ms as i64 + jitter_offset).max(1) as u64;
    Duration::from_millis(final_ms)
}
