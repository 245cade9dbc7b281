// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module owns the crate's seam to the broker. `BrokerChannel` is the
//! set of AMQP operations the other components run against; `AmqpChannel`
//! implements it over a lapin channel; `ConnectionManager` holds the
//! process-wide connection, reopening it lazily when it reports disconnected
//! and handing out a fresh channel per logical unit of work. Channels are
//! never shared between consumers.

use crate::{
    config::AmqpConfig,
    envelope::Envelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::OutgoingMessage,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
#[cfg(test)]
use mockall::automock;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// A stream of deliveries from one consumer, already detached from lapin's
/// types.
pub type DeliveryStream = BoxStream<'static, Result<Envelope, AmqpError>>;

/// The AMQP operations the crate's components are built on.
///
/// One implementor wraps a live lapin channel; tests substitute a mock. A
/// delivery tag is only meaningful on the channel that produced it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares an exchange. Declaring the default (empty-named) exchange is
    /// a no-op, it always exists.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns the message count the broker reported.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32, AmqpError>;

    /// Binds a queue to an exchange.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries in flight on this
    /// channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Publishes a message to the given exchange.
    async fn publish(&self, exchange: &str, message: &OutgoingMessage) -> Result<(), AmqpError>;

    /// Fetches a single message without starting a consumer.
    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Envelope>, AmqpError>;

    /// Starts a consumer on the queue and returns its delivery stream.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Stops deliveries for the given consumer tag.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Acknowledges the delivery with the given tag.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects the delivery with the given tag.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// `BrokerChannel` over a live lapin channel.
///
/// Every broker fault is logged where it happens and mapped to the matching
/// `AmqpError` variant. Publishing is bounded by the configured write timeout
/// when one is set.
pub struct AmqpChannel {
    channel: Channel,
    write_timeout: Duration,
}

impl AmqpChannel {
    pub fn new(channel: Channel, write_timeout: Duration) -> AmqpChannel {
        AmqpChannel {
            channel,
            write_timeout,
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if def.name.is_empty() {
            return Ok(());
        }

        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "failure to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.arguments()),
            )
            .await
        {
            Ok(state) => Ok(state.message_count()),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "failure to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::from(binding.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "failure to bind the queue to the exchange"
                );
                Err(AmqpError::BindQueueError(
                    binding.queue_name.clone(),
                    binding.exchange_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(AmqpError::QosError(prefetch_count.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, exchange: &str, message: &OutgoingMessage) -> Result<(), AmqpError> {
        let publishing = self.channel.basic_publish(
            exchange,
            &message.routing_key,
            BasicPublishOptions {
                mandatory: message.mandatory,
                immediate: false,
            },
            &message.payload,
            message.properties.clone(),
        );

        let published = if self.write_timeout.is_zero() {
            publishing.await
        } else {
            match tokio::time::timeout(self.write_timeout, publishing).await {
                Ok(published) => published,
                Err(_) => {
                    error!(exchange = exchange, "publish timed out");
                    return Err(AmqpError::PublishError(exchange.to_owned()));
                }
            }
        };

        match published {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = exchange,
                    "failure to publish"
                );
                Err(AmqpError::PublishError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Envelope>, AmqpError> {
        match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
        {
            Ok(Some(message)) => Ok(Some(Envelope::from(message.delivery))),
            Ok(None) => Ok(None),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue,
                    "failure to get a message"
                );
                Err(AmqpError::GetMessageError(queue.to_owned()))
            }
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = queue,
                    "failure to create the consumer"
                );
                return Err(AmqpError::ConsumerError(queue.to_owned()));
            }
        };

        let queue = queue.to_owned();
        Ok(consumer
            .map(move |delivered| match delivered {
                Ok(delivery) => Ok(Envelope::from(delivery)),
                Err(err) => {
                    error!(error = err.to_string(), "failure to receive a delivery");
                    Err(AmqpError::ConsumerError(queue.clone()))
                }
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    tag = consumer_tag,
                    "failure to cancel the consumer"
                );
                Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to ack the message");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to reject the message");
                Err(AmqpError::RejectMessageError)
            }
            _ => Ok(()),
        }
    }
}

/// Owner of the process-wide broker connection.
///
/// The connection is opened lazily on the first channel request and reopened
/// when the existing one reports disconnected. Reconnecting is a single
/// attempt at channel-acquisition time; there is no supervised retry loop.
pub struct ConnectionManager {
    config: AmqpConfig,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new(config: AmqpConfig) -> ConnectionManager {
        ConnectionManager {
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    /// Returns a fresh channel, (re)opening the shared connection first when
    /// needed.
    pub async fn channel(&self) -> Result<Arc<AmqpChannel>, AmqpError> {
        let connection = self.connection().await?;

        debug!("creating amqp channel...");
        match connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel::new(
                    channel,
                    self.config.write_timeout(),
                )))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to create a channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut guard = self.connection.lock().await;

        if let Some(connection) = guard.as_ref() {
            if connection.status().connected() {
                return Ok(connection.clone());
            }
        }

        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.config.connection_name.clone()));

        let uri = self.config.uri();
        let connecting = Connection::connect(&uri, options);
        let connected = if self.config.connect_timeout().is_zero() {
            connecting.await
        } else {
            match tokio::time::timeout(self.config.connect_timeout(), connecting).await {
                Ok(connected) => connected,
                Err(_) => {
                    error!(
                        host = self.config.host.as_str(),
                        "connection attempt timed out"
                    );
                    return Err(AmqpError::ConnectionError);
                }
            }
        };

        match connected {
            Ok(connection) => {
                debug!("amqp connected");
                let connection = Arc::new(connection);
                *guard = Some(connection.clone());
                Ok(connection)
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }
    }

    /// Closes the shared connection if one is open.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut guard = self.connection.lock().await;

        if let Some(connection) = guard.take() {
            if let Err(err) = connection.close(200, "closing").await {
                error!(error = err.to_string(), "failure to close the connection");
                return Err(AmqpError::ConnectionError);
            }
        }

        Ok(())
    }
}
