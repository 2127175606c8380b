// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! One [`AmqpLink`] owns one connection and one channel; the RPC layer
//! multiplexes all of its traffic over them. Deliveries are acknowledged on
//! receipt and forwarded to the subscriber through a bounded channel.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;

use super::{BrokerLink, BrokerTransport, ConsumerEvent, Envelope, InboundMessage,
    EVENT_CHANNEL_CAPACITY};
use crate::config::AmqpConfig;
use crate::error::{Error, Result};

/// Default transport: real AMQP 0-9-1 over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTransport;

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn open(&self, host: &str, port: u16, config: &AmqpConfig) -> Result<Box<dyn BrokerLink>> {
        let uri = build_uri(host, port, config);
        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;

        log::debug!("[AMQP] Connected to {}:{} (vhost '{}')", host, port, config.virtualhost);
        Ok(Box::new(AmqpLink {
            connection,
            channel,
        }))
    }
}

/// Build the connection URI from one candidate endpoint plus credentials.
fn build_uri(host: &str, port: u16, config: &AmqpConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: host.to_string(),
            port,
        },
        vhost: config.virtualhost.clone(),
        query: AMQPQueryString {
            heartbeat: Some(config.heartbeat),
            ..Default::default()
        },
    }
}

/// Live connection to one AMQP broker.
pub struct AmqpLink {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerLink for AmqpLink {
    async fn declare_reply_queue(&self) -> Result<String> {
        // Server-named: pass the empty queue name and read back what the
        // broker chose. Exclusive + auto-delete ties the queue's lifetime
        // to this connection.
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::DeclareFailed(format!("reply queue: {}", e)))?;

        let name = queue.name().as_str().to_string();
        log::debug!("[AMQP] Declared reply queue '{}'", name);
        Ok(name)
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::DeclareFailed(format!("queue '{}': {}", name, e)))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                Error::DeclareFailed(format!(
                    "bind '{}' to '{}' ('{}'): {}",
                    queue, exchange, routing_key, e
                ))
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<ConsumerEvent>> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::DeclareFailed(format!("consume '{}': {}", queue, e)))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        // Ack on receipt: correlation failures are not the
                        // broker's problem to redeliver.
                        if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                            log::warn!("[AMQP] Ack failed on '{}': {}", queue_name, e);
                        }
                        let message = InboundMessage {
                            routing_key: delivery.routing_key.as_str().to_string(),
                            correlation_id: delivery
                                .properties
                                .correlation_id()
                                .as_ref()
                                .map(|s| s.as_str().to_string()),
                            reply_to: delivery
                                .properties
                                .reply_to()
                                .as_ref()
                                .map(|s| s.as_str().to_string()),
                            payload: delivery.data,
                        };
                        if event_tx.send(ConsumerEvent::Delivery(message)).await.is_err() {
                            // Subscriber dropped its receiver; stop pumping.
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!("[AMQP] Consumer on '{}' failed: {}", queue_name, e);
                        let _ = event_tx
                            .send(ConsumerEvent::Closed {
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
            // Stream ended: channel or connection closed underneath us.
            let _ = event_tx
                .send(ConsumerEvent::Closed {
                    reason: "consumer stream ended".to_string(),
                })
                .await;
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
        let mut properties = BasicProperties::default();
        if let Some(id) = &envelope.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id.clone()));
        }
        if let Some(reply_to) = &envelope.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
        }
        if let Some(ttl_ms) = envelope.expiration_ms {
            // AMQP wants the per-message TTL as a decimal string.
            properties = properties.with_expiration(ShortString::from(ttl_ms.to_string()));
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| Error::PublishFailed(format!("'{}' via '{}': {}", routing_key, exchange, e)))?
            .await
            .map_err(|e| Error::PublishFailed(format!("'{}' via '{}': {}", routing_key, exchange, e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "client shutdown").await {
                // Racing against a dying connection; nothing left to tear down.
                log::debug!("[AMQP] Close raced with connection loss: {}", e);
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_carries_candidate_and_credentials() {
        let config = AmqpConfig::for_host("ignored", 1)
            .with_credentials("svc", "secret")
            .with_virtualhost("orders")
            .with_heartbeat(15);

        let uri = build_uri("rabbit-2", 5673, &config);
        assert_eq!(uri.authority.host, "rabbit-2");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "svc");
        assert_eq!(uri.authority.userinfo.password, "secret");
        assert_eq!(uri.vhost, "orders");
        assert_eq!(uri.query.heartbeat, Some(15));
    }
}
