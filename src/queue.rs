// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declaration and Consumption
//!
//! This module provides the queue-facing surface of the crate: a builder for
//! queue definitions (including dead-letter and TTL arguments), a handle for
//! declare/bind/get/ack/reject operations, and a subscription type whose read
//! outcome distinguishes a delivery from a read timeout and from consumer
//! cancellation. A read timeout is an expected end of consumption, not a
//! fault.

use crate::{
    channel::{BrokerChannel, DeliveryStream},
    envelope::Envelope,
    errors::AmqpError,
};
use futures_util::StreamExt;
use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::debug;

/// Queue argument naming the exchange that receives dead-lettered messages
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument holding the per-message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument holding the maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Queue argument holding the maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue
/// definitions. It supports standard queue options as well as message TTL,
/// length limits, and dead-letter routing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable,
    /// non-exclusive, no extra arguments).
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new queue definition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration passive, checking for existence without
    /// creating the queue.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the no_wait flag, making the operation non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live for the queue.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Routes messages that are rejected or expire to the given exchange.
    pub fn dead_letter_to(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Overrides the routing key used when dead-lettering.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.dead_letter_routing_key = Some(key.to_owned());
        self
    }

    /// Assembles the x-arguments for the declare call.
    pub(crate) fn arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to bind
    ///
    /// # Returns
    /// A new queue binding with default settings
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Adds a single binding argument.
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }
}

/// The result of waiting for the next delivery on a subscription.
///
/// A read timeout and a consumer cancellation both end consumption without
/// being faults; only broker errors surface as `Err`.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A message arrived.
    Delivered(Envelope),
    /// The configured read timeout elapsed with no delivery.
    TimedOut,
    /// The delivery stream closed, usually after a consumer cancel.
    Cancelled,
}

/// A declared queue bound to the channel that declared it.
pub struct Queue {
    channel: Arc<dyn BrokerChannel>,
    name: String,
    message_count: u32,
}

impl Queue {
    /// Declares the queue on the broker and returns a handle to it.
    ///
    /// The handle remembers the message count the broker reported at declare
    /// time.
    ///
    /// # Parameters
    /// * `channel` - The channel to declare on
    /// * `def` - The queue definition
    ///
    /// # Returns
    /// A queue handle on success, or the declare error
    pub async fn declare(
        channel: Arc<dyn BrokerChannel>,
        def: &QueueDefinition,
    ) -> Result<Queue, AmqpError> {
        let message_count = channel.declare_queue(def).await?;

        Ok(Queue {
            channel,
            name: def.name.clone(),
            message_count,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of messages the broker reported when the queue was
    /// declared.
    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    /// Binds this queue to an exchange.
    pub async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel.bind_queue(binding).await
    }

    /// Fetches a single message without starting a consumer.
    pub async fn get(&self, no_ack: bool) -> Result<Option<Envelope>, AmqpError> {
        self.channel.get(&self.name, no_ack).await
    }

    /// Starts consuming from this queue.
    ///
    /// The returned subscription yields deliveries until cancelled; when
    /// `read_timeout` is nonzero, a wait longer than it ends with
    /// `ReadOutcome::TimedOut` instead of blocking forever.
    ///
    /// # Parameters
    /// * `consumer_tag` - Identifier for this consumer on the queue
    /// * `read_timeout` - Longest wait for a single delivery; zero disables
    ///
    /// # Returns
    /// A subscription over the incoming deliveries
    pub async fn consume(
        &self,
        consumer_tag: &str,
        read_timeout: Duration,
    ) -> Result<Subscription, AmqpError> {
        let stream = self.channel.consume(&self.name, consumer_tag).await?;

        Ok(Subscription {
            channel: self.channel.clone(),
            consumer_tag: consumer_tag.to_owned(),
            read_timeout,
            stream,
        })
    }

    /// Stops deliveries for the given consumer tag.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel.cancel(consumer_tag).await
    }

    /// Acknowledges a delivery by tag.
    pub async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel.ack(delivery_tag).await
    }

    /// Rejects a delivery by tag, optionally asking the broker to requeue it.
    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel.reject(delivery_tag, requeue).await
    }
}

/// An active consumer on a queue.
pub struct Subscription {
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: String,
    read_timeout: Duration,
    stream: DeliveryStream,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Waits for the next delivery.
    ///
    /// Returns `TimedOut` when the read timeout elapses first and `Cancelled`
    /// when the stream has closed; both are regular outcomes. Stream faults
    /// are returned as errors.
    pub async fn next(&mut self) -> Result<ReadOutcome, AmqpError> {
        let next = if self.read_timeout.is_zero() {
            self.stream.next().await
        } else {
            match tokio::time::timeout(self.read_timeout, self.stream.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(ReadOutcome::TimedOut),
            }
        };

        match next {
            Some(Ok(envelope)) => Ok(ReadOutcome::Delivered(envelope)),
            Some(Err(err)) => Err(err),
            None => Ok(ReadOutcome::Cancelled),
        }
    }

    /// Cancels this subscription's consumer tag.
    ///
    /// Deliveries already taken from the stream are unaffected.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        self.channel.cancel(&self.consumer_tag).await
    }
}

/// Reports how many messages are currently sitting in the named queue.
///
/// The queue is declared passively; any declare error is swallowed and
/// reported as zero. The count is diagnostic, not a basis for control flow.
pub async fn count_messages(channel: &dyn BrokerChannel, queue: &str) -> u32 {
    let def = QueueDefinition::new(queue).passive();

    match channel.declare_queue(&def).await {
        Ok(count) => count,
        Err(err) => {
            debug!(
                error = err.to_string(),
                queue = queue,
                "count query failed, reporting zero"
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockBrokerChannel;
    use futures_util::stream;
    use lapin::BasicProperties;
    use mockall::predicate::eq;

    fn envelope() -> Envelope {
        Envelope::new(
            1,
            "orders",
            "orders.created",
            false,
            BasicProperties::default(),
            b"{}".to_vec(),
        )
    }

    #[test]
    fn definition_assembles_declare_arguments() {
        let def = QueueDefinition::new("orders")
            .durable()
            .ttl(60_000)
            .max_length(1_000)
            .dead_letter_to("orders.failed")
            .dead_letter_routing_key("orders");

        let args = def.arguments();
        assert_eq!(
            args.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(60_000))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_MAX_LENGTH),
            Some(&AMQPValue::LongInt(1_000))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString("orders.failed".into()))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString("orders".into()))
        );
        assert_eq!(args.get(AMQP_HEADERS_MAX_LENGTH_BYTES), None);
    }

    #[test]
    fn binding_builder_keeps_queue_and_targets() {
        let binding = QueueBinding::new("orders")
            .exchange("orders.retry")
            .routing_key("orders.created");

        assert_eq!(binding.queue_name, "orders");
        assert_eq!(binding.exchange_name, "orders.retry");
        assert_eq!(binding.routing_key, "orders.created");
        assert!(binding.params.is_empty());
    }

    #[tokio::test]
    async fn declare_keeps_broker_reported_message_count() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_queue()
            .with(eq(QueueDefinition::new("orders").durable()))
            .times(1)
            .returning(|_| Ok(7));

        let queue = Queue::declare(Arc::new(mock), &QueueDefinition::new("orders").durable())
            .await
            .unwrap();

        assert_eq!(queue.name(), "orders");
        assert_eq!(queue.message_count(), 7);
    }

    #[tokio::test]
    async fn count_messages_reports_zero_on_declare_error() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_queue()
            .times(1)
            .returning(|_| Err(AmqpError::DeclareQueueError("nonexistent-queue".to_owned())));

        assert_eq!(count_messages(&mock, "nonexistent-queue").await, 0);
    }

    #[tokio::test]
    async fn count_messages_queries_passively() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_queue()
            .withf(|def| def.passive && def.name == "orders")
            .times(1)
            .returning(|_| Ok(3));

        assert_eq!(count_messages(&mock, "orders").await, 3);
    }

    #[tokio::test]
    async fn subscription_yields_deliveries_then_cancelled() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_consume()
            .with(eq("orders"), eq("tag-1"))
            .times(1)
            .returning(|_, _| Ok(Box::pin(stream::iter(vec![Ok(envelope())]))));

        let queue = declared_queue(mock).await;
        let mut subscription = queue.consume("tag-1", Duration::ZERO).await.unwrap();

        match subscription.next().await.unwrap() {
            ReadOutcome::Delivered(envelope) => assert_eq!(envelope.routing_key(), "orders.created"),
            other => panic!("expected a delivery, got {other:?}"),
        }
        assert!(matches!(
            subscription.next().await.unwrap(),
            ReadOutcome::Cancelled
        ));
    }

    #[tokio::test]
    async fn subscription_times_out_without_error() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_consume()
            .times(1)
            .returning(|_, _| Ok(Box::pin(stream::pending())));

        let queue = declared_queue(mock).await;
        let mut subscription = queue
            .consume("tag-1", Duration::from_millis(10))
            .await
            .unwrap();

        assert!(matches!(
            subscription.next().await.unwrap(),
            ReadOutcome::TimedOut
        ));
    }

    #[tokio::test]
    async fn subscription_surfaces_stream_faults() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_consume().times(1).returning(|_, _| {
            Ok(Box::pin(stream::iter(vec![Err(AmqpError::ConsumerError(
                "orders".to_owned(),
            ))])))
        });

        let queue = declared_queue(mock).await;
        let mut subscription = queue.consume("tag-1", Duration::ZERO).await.unwrap();

        match subscription.next().await {
            Err(AmqpError::ConsumerError(queue)) => assert_eq!(queue, "orders"),
            other => panic!("expected the stream fault to surface, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscription_cancel_uses_its_consumer_tag() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_consume()
            .times(1)
            .returning(|_, _| Ok(Box::pin(stream::pending())));
        mock.expect_cancel()
            .with(eq("tag-9"))
            .times(1)
            .returning(|_| Ok(()));

        let queue = declared_queue(mock).await;
        let subscription = queue.consume("tag-9", Duration::ZERO).await.unwrap();

        assert_eq!(subscription.consumer_tag(), "tag-9");
        subscription.cancel().await.unwrap();
    }

    async fn declared_queue(mut mock: MockBrokerChannel) -> Queue {
        mock.expect_declare_queue().returning(|_| Ok(0));
        Queue::declare(Arc::new(mock), &QueueDefinition::new("orders"))
            .await
            .unwrap()
    }
}
