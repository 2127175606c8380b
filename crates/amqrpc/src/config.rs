// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection descriptor and RPC client options.

use std::time::Duration;

/// Connection descriptor for the broker.
///
/// Lists the candidate endpoints in the order they are tried, plus the
/// credentials and the bounded-retry knobs used by
/// [`AsyncAmqpRpc::connect`](crate::AsyncAmqpRpc::connect). Immutable once
/// handed to the client.
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    /// Candidate (host, port) pairs, tried in order on each connect pass.
    pub hosts: Vec<(String, u16)>,

    /// AMQP virtual host.
    pub virtualhost: String,

    /// Login user name.
    pub username: String,

    /// Login password.
    pub password: String,

    /// Heartbeat interval negotiated with the broker, in seconds.
    pub heartbeat: u16,

    /// Timeout for a single connection attempt to one candidate.
    pub connect_timeout: Duration,

    /// Maximum number of full candidate passes before `connect` gives up.
    pub connect_attempts: u32,

    /// Backoff before the second candidate pass; doubles per pass.
    pub retry_delay: Duration,

    /// Upper bound on the backoff between passes.
    pub max_retry_delay: Duration,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            hosts: vec![("localhost".to_string(), 5672)],
            virtualhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat: 60,
            connect_timeout: Duration::from_secs(5),
            connect_attempts: 5,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl AmqpConfig {
    /// Create a configuration with the given candidate endpoints.
    pub fn new(hosts: Vec<(String, u16)>) -> Self {
        Self {
            hosts,
            ..Default::default()
        }
    }

    /// Create a configuration for a single endpoint.
    pub fn for_host(host: impl Into<String>, port: u16) -> Self {
        Self::new(vec![(host.into(), port)])
    }

    /// Builder: set login credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Builder: set the virtual host.
    pub fn with_virtualhost(mut self, virtualhost: impl Into<String>) -> Self {
        self.virtualhost = virtualhost.into();
        self
    }

    /// Builder: set the heartbeat interval in seconds.
    pub fn with_heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = seconds;
        self
    }

    /// Builder: set the per-attempt connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder: set the number of candidate passes before giving up.
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    /// Builder: set the base backoff between candidate passes.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Builder: set the backoff cap.
    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.hosts.is_empty() {
            return Err("hosts must not be empty");
        }
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be > 0");
        }
        if self.connect_attempts == 0 {
            return Err("connect_attempts must be >= 1");
        }
        if self.retry_delay.is_zero() {
            return Err("retry_delay must be > 0");
        }
        if self.max_retry_delay < self.retry_delay {
            return Err("max_retry_delay must be >= retry_delay");
        }
        Ok(())
    }
}

/// RPC-level options, separate from the connection descriptor.
#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// Pre-existing exchange the reply queue is bound to. When unset
    /// (default) replies arrive via the default exchange, routed straight
    /// to the exclusive reply queue.
    pub callback_exchange: Option<String>,

    /// Exchange the responder role publishes replies to. Empty string is
    /// the default exchange (direct routing on `reply_to`).
    pub reply_exchange: String,

    /// Deadline used by [`call_default`](crate::AsyncAmqpRpc::call_default).
    pub default_timeout: Duration,

    /// Log replies whose correlation id matches no pending call. They are
    /// dropped either way; whether they are worth a log line is an
    /// operational choice.
    pub log_unrouted_replies: bool,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            callback_exchange: None,
            reply_exchange: String::new(),
            default_timeout: Duration::from_secs(30),
            log_unrouted_replies: true,
        }
    }
}

impl RpcOptions {
    /// Builder: route replies through a pre-existing exchange.
    pub fn with_callback_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.callback_exchange = Some(exchange.into());
        self
    }

    /// Builder: set the exchange replies are published to by the responder.
    pub fn with_reply_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.reply_exchange = exchange.into();
        self
    }

    /// Builder: set the default call deadline.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Builder: drop unrouted replies silently.
    pub fn without_unrouted_logging(mut self) -> Self {
        self.log_unrouted_replies = false;
        self
    }

    /// Validate options.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.default_timeout.is_zero() {
            return Err("default_timeout must be > 0");
        }
        if let Some(exchange) = &self.callback_exchange {
            if exchange.is_empty() {
                return Err("callback_exchange must not be the default exchange");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AmqpConfig::default();
        assert_eq!(config.hosts, vec![("localhost".to_string(), 5672)]);
        assert_eq!(config.virtualhost, "/");
        assert_eq!(config.heartbeat, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = AmqpConfig::new(vec![
            ("rabbit-1".to_string(), 5672),
            ("rabbit-2".to_string(), 5673),
        ])
        .with_credentials("svc", "secret")
        .with_virtualhost("orders")
        .with_heartbeat(20)
        .with_connect_timeout(Duration::from_secs(2))
        .with_connect_attempts(3)
        .with_retry_delay(Duration::from_millis(200))
        .with_max_retry_delay(Duration::from_secs(5));

        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.username, "svc");
        assert_eq!(config.virtualhost, "orders");
        assert_eq!(config.heartbeat, 20);
        assert_eq!(config.connect_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_errors() {
        let mut config = AmqpConfig {
            hosts: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.hosts = vec![("localhost".to_string(), 5672)];
        config.connect_attempts = 0;
        assert!(config.validate().is_err());

        config.connect_attempts = 1;
        config.max_retry_delay = Duration::from_millis(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_options() {
        let options = RpcOptions::default();
        assert!(options.callback_exchange.is_none());
        assert!(options.reply_exchange.is_empty());
        assert!(options.log_unrouted_replies);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn options_builders() {
        let options = RpcOptions::default()
            .with_callback_exchange("rpc.replies")
            .with_reply_exchange("rpc.replies")
            .with_default_timeout(Duration::from_secs(5))
            .without_unrouted_logging();

        assert_eq!(options.callback_exchange.as_deref(), Some("rpc.replies"));
        assert_eq!(options.reply_exchange, "rpc.replies");
        assert_eq!(options.default_timeout, Duration::from_secs(5));
        assert!(!options.log_unrouted_replies);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn empty_callback_exchange_rejected() {
        let options = RpcOptions {
            callback_exchange: Some(String::new()),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
