// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Quarantine
//!
//! Settlement of handled deliveries. A successful delivery is acked; a
//! failed one is either rescheduled through its retry exchange with one more
//! death stamped, rejected into the queue's own dead-letter routing when no
//! delay is configured, or quarantined to the failed exchange once its
//! retries are spent.
//!
//! The original delivery is only acked after the replacement message was
//! accepted by the broker, so a crash in between duplicates the message
//! instead of losing it.
//!
//! The delayed path expects external topology: the retry exchange must feed
//! a holding queue whose message TTL covers the longest delay any policy can
//! produce and whose dead-letter setup routes expired messages back to the
//! source exchange. Likewise the failed exchange needs at least one bound
//! queue, or the broker drops quarantined messages.

use crate::{
    channel::BrokerChannel,
    config::AmqpConfig,
    death::{self, REASON_REJECTED},
    envelope::Envelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::{ExchangePublisher, OutgoingMessage},
    task::Task,
};
use lapin::types::ShortString;
use std::{sync::Arc, time::Duration};
use tracing::{error, warn};

/// Picks the delay before a failed delivery is attempted again.
pub trait DelayPolicy: Send + Sync {
    /// `death_count` is how many times the message already died, zero on
    /// the first failure.
    fn delay_for(&self, death_count: i64) -> Duration;
}

/// The same delay for every attempt.
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> FixedDelay {
        FixedDelay { delay }
    }
}

impl DelayPolicy for FixedDelay {
    fn delay_for(&self, _: i64) -> Duration {
        self.delay
    }
}

/// One delay per attempt, holding the last step once the attempts outnumber
/// the steps.
pub struct SteppedDelay {
    steps: Vec<Duration>,
}

impl SteppedDelay {
    pub fn new(steps: Vec<Duration>) -> SteppedDelay {
        SteppedDelay { steps }
    }
}

impl DelayPolicy for SteppedDelay {
    fn delay_for(&self, death_count: i64) -> Duration {
        if self.steps.is_empty() {
            return Duration::ZERO;
        }

        let index = (death_count.max(0) as usize).min(self.steps.len() - 1);
        self.steps[index]
    }
}

/// What settlement did with the delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled successfully and acked.
    Completed,
    /// Republished to the retry exchange with one more death recorded.
    Retried { delay: Duration },
    /// Rejected without requeue, leaving dead-lettering to the queue.
    Rejected,
    /// Moved to the failed exchange, out of the processing path.
    Quarantined,
}

/// Decides the fate of every delivery once its handler ran.
pub struct RetryCoordinator {
    channel: Arc<dyn BrokerChannel>,
    config: AmqpConfig,
}

impl RetryCoordinator {
    pub fn new(channel: Arc<dyn BrokerChannel>, config: &AmqpConfig) -> RetryCoordinator {
        RetryCoordinator {
            channel,
            config: config.clone(),
        }
    }

    /// Settles one delivery.
    ///
    /// `handled` reports whether the task handler succeeded. Failed
    /// deliveries are compared against the task's retry budget using the
    /// count of the most recent death: once it reaches `max_retry - 1`
    /// the message is quarantined, otherwise it is rescheduled. A zero
    /// delay turns the reschedule into a plain reject, trusting the
    /// queue's dead-letter configuration to route the message.
    ///
    /// # Parameters
    ///
    /// * `task` - the task the delivery belongs to
    /// * `envelope` - the delivery being settled
    /// * `handled` - whether the handler succeeded
    ///
    /// # Returns
    ///
    /// The disposition applied, or the broker error that interrupted it.
    pub async fn settle(
        &self,
        task: &Task,
        envelope: &Envelope,
        handled: bool,
    ) -> Result<Disposition, AmqpError> {
        if handled {
            self.channel.ack(envelope.delivery_tag()).await?;
            return Ok(Disposition::Completed);
        }

        let deaths = death::death_count(envelope, "");

        if deaths >= i64::from(task.max_retry) - 1 {
            return self.quarantine(task, envelope).await;
        }

        let delay = task.retry.delay.delay_for(deaths);
        if delay.is_zero() {
            self.channel.reject(envelope.delivery_tag(), false).await?;
            return Ok(Disposition::Rejected);
        }

        self.reschedule(task, envelope, delay).await
    }

    async fn reschedule(
        &self,
        task: &Task,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<Disposition, AmqpError> {
        let exchange = match &task.retry.exchange {
            Some(exchange) => exchange.clone(),
            None => self.config.retry_exchange_for(envelope.exchange()),
        };

        warn!(
            queue = task.queue.as_str(),
            exchange = exchange.as_str(),
            delay_ms = delay.as_millis() as u64,
            "handler failed, scheduling a retry"
        );

        let mut publisher = ExchangePublisher::new(self.channel.clone());
        publisher
            .declare(
                ExchangeDefinition::new(&exchange)
                    .kind(task.retry.exchange_kind.clone())
                    .durable(),
            )
            .await?;

        let headers = death::record_death(envelope, REASON_REJECTED, &task.queue);
        let properties = envelope
            .properties()
            .clone()
            .with_headers(headers)
            .with_expiration(ShortString::from(delay.as_millis().to_string()));

        let mut message = OutgoingMessage::from(envelope).properties(properties);
        if let Some(routing_key) = &task.retry.routing_key {
            message = message.routing_key(routing_key);
        }

        publisher.publish(&message).await?;
        self.channel.ack(envelope.delivery_tag()).await?;

        Ok(Disposition::Retried { delay })
    }

    async fn quarantine(&self, task: &Task, envelope: &Envelope) -> Result<Disposition, AmqpError> {
        let exchange = match &task.failed.exchange {
            Some(exchange) => exchange.clone(),
            None => self.config.failed_exchange_for(envelope.exchange()),
        };

        error!(
            queue = task.queue.as_str(),
            exchange = exchange.as_str(),
            "retries exhausted, sending the message to the failed exchange"
        );

        let mut publisher = ExchangePublisher::new(self.channel.clone());
        publisher
            .declare(
                ExchangeDefinition::new(&exchange)
                    .kind(task.failed.exchange_kind.clone())
                    .durable(),
            )
            .await?;

        let mut message = OutgoingMessage::from(envelope);
        if let Some(routing_key) = &task.failed.routing_key {
            message = message.routing_key(routing_key);
        }

        publisher.publish(&message).await?;
        self.channel.ack(envelope.delivery_tag()).await?;

        Ok(Disposition::Quarantined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockBrokerChannel,
        death::{death_count, DeathRecord, AMQP_HEADERS_X_DEATH},
        exchange::ExchangeKind,
        handler::{HandlerError, MessageHandler},
    };
    use async_trait::async_trait;
    use lapin::{
        types::{AMQPValue, FieldArray, FieldTable},
        BasicProperties,
    };
    use mockall::predicate::eq;
    use std::sync::Mutex;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _: &Envelope, _: i64) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn coordinator(mock: MockBrokerChannel) -> RetryCoordinator {
        RetryCoordinator::new(Arc::new(mock), &AmqpConfig::default())
    }

    fn envelope() -> Envelope {
        Envelope::new(
            7,
            "orders",
            "orders.created",
            false,
            BasicProperties::default(),
            b"{}".to_vec(),
        )
    }

    fn dead_envelope(count: i64, queue: &str) -> Envelope {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![DeathRecord {
                count,
                exchange: "orders".to_owned(),
                queue: queue.to_owned(),
                reason: REASON_REJECTED.to_owned(),
                routing_keys: vec!["orders.created".to_owned()],
                time: 1,
            }
            .encode()])),
        );

        Envelope::new(
            7,
            "orders",
            "orders.created",
            true,
            BasicProperties::default().with_headers(headers),
            b"{}".to_vec(),
        )
    }

    #[test]
    fn stepped_delay_holds_the_last_step() {
        let policy = SteppedDelay::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(30),
        ]);

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(30));
        assert_eq!(policy.delay_for(9), Duration::from_secs(30));
        assert_eq!(policy.delay_for(-1), Duration::from_secs(1));
    }

    #[test]
    fn empty_stepped_delay_means_no_delay() {
        assert!(SteppedDelay::new(vec![]).delay_for(3).is_zero());
    }

    #[tokio::test]
    async fn successful_handling_only_acks() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_ack()
            .with(eq(7u64))
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_publish().times(0);
        mock.expect_reject().times(0);

        let task = Task::builder("orders", Arc::new(NoopHandler)).build();

        let outcome = coordinator(mock)
            .settle(&task, &envelope(), true)
            .await
            .unwrap();

        assert_eq!(outcome, Disposition::Completed);
    }

    #[tokio::test]
    async fn first_failure_reschedules_with_one_death_recorded() {
        let published: Arc<Mutex<Vec<(String, OutgoingMessage)>>> = Arc::new(Mutex::new(vec![]));
        let captured = published.clone();

        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_exchange()
            .withf(|def: &ExchangeDefinition| {
                def.name == "orders.retry" && def.durable && def.kind == ExchangeKind::Fanout
            })
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_publish().times(1).returning(move |exchange, message| {
            captured
                .lock()
                .unwrap()
                .push((exchange.to_owned(), message.clone()));
            Ok(())
        });
        mock.expect_ack()
            .with(eq(7u64))
            .times(1)
            .returning(|_| Ok(()));

        let task = Task::builder("orders", Arc::new(NoopHandler))
            .retry_delay(FixedDelay::new(Duration::from_secs(3)))
            .build();

        let outcome = coordinator(mock)
            .settle(&task, &envelope(), false)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Disposition::Retried {
                delay: Duration::from_secs(3)
            }
        );

        let published = published.lock().unwrap();
        let (exchange, message) = &published[0];
        assert_eq!(exchange, "orders.retry");
        assert_eq!(
            message.properties.expiration().clone().map(|e| e.to_string()),
            Some("3000".to_owned())
        );

        let rescheduled = Envelope::new(
            8,
            "orders",
            "orders.created",
            false,
            message.properties.clone(),
            message.payload.clone(),
        );
        assert_eq!(death_count(&rescheduled, ""), 1);
    }

    #[tokio::test]
    async fn retry_overrides_replace_the_derived_names() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_exchange()
            .withf(|def: &ExchangeDefinition| def.name == "orders.backoff")
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_publish()
            .withf(|exchange: &str, message: &OutgoingMessage| {
                exchange == "orders.backoff" && message.routing_key == "orders.delayed"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_ack().times(1).returning(|_| Ok(()));

        let task = Task::builder("orders", Arc::new(NoopHandler))
            .retry_delay(FixedDelay::new(Duration::from_millis(250)))
            .retry_exchange("orders.backoff")
            .retry_routing_key("orders.delayed")
            .build();

        let outcome = coordinator(mock)
            .settle(&task, &envelope(), false)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Disposition::Retried {
                delay: Duration::from_millis(250)
            }
        );
    }

    #[tokio::test]
    async fn exhausted_retries_quarantine_with_headers_untouched() {
        let envelope = dead_envelope(4, "orders");
        let properties = envelope.properties().clone();

        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_exchange()
            .withf(|def: &ExchangeDefinition| {
                def.name == "orders.failed" && def.durable && def.kind == ExchangeKind::Fanout
            })
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_publish()
            .withf(move |exchange: &str, message: &OutgoingMessage| {
                exchange == "orders.failed"
                    && message.properties == properties
                    && message.routing_key == "orders.created"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_ack()
            .with(eq(7u64))
            .times(1)
            .returning(|_| Ok(()));

        let task = Task::builder("orders", Arc::new(NoopHandler))
            .retry_delay(FixedDelay::new(Duration::from_secs(3)))
            .build();

        let outcome = coordinator(mock)
            .settle(&task, &envelope, false)
            .await
            .unwrap();

        assert_eq!(outcome, Disposition::Quarantined);
    }

    #[tokio::test]
    async fn a_death_in_another_queue_counts_toward_quarantine() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_exchange()
            .withf(|def: &ExchangeDefinition| def.name == "orders.failed")
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_publish()
            .withf(|exchange: &str, _: &OutgoingMessage| exchange == "orders.failed")
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_ack()
            .with(eq(7u64))
            .times(1)
            .returning(|_| Ok(()));

        let task = Task::builder("orders", Arc::new(NoopHandler))
            .retry_delay(FixedDelay::new(Duration::from_secs(3)))
            .build();

        let outcome = coordinator(mock)
            .settle(&task, &dead_envelope(4, "orders.v1"), false)
            .await
            .unwrap();

        assert_eq!(outcome, Disposition::Quarantined);
    }

    #[tokio::test]
    async fn zero_delay_rejects_without_republishing() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_reject()
            .with(eq(7u64), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_declare_exchange().times(0);
        mock.expect_publish().times(0);
        mock.expect_ack().times(0);

        let task = Task::builder("orders", Arc::new(NoopHandler)).build();

        let outcome = coordinator(mock)
            .settle(&task, &envelope(), false)
            .await
            .unwrap();

        assert_eq!(outcome, Disposition::Rejected);
    }

    #[tokio::test]
    async fn a_message_is_rescheduled_twice_then_quarantined() {
        let published: Arc<Mutex<Vec<(String, OutgoingMessage)>>> = Arc::new(Mutex::new(vec![]));
        let captured = published.clone();

        let mut mock = MockBrokerChannel::new();
        mock.expect_declare_exchange().times(3).returning(|_| Ok(()));
        mock.expect_publish().times(3).returning(move |exchange, message| {
            captured
                .lock()
                .unwrap()
                .push((exchange.to_owned(), message.clone()));
            Ok(())
        });
        mock.expect_ack().times(3).returning(|_| Ok(()));
        mock.expect_reject().times(0);

        let task = Task::builder("orders", Arc::new(NoopHandler))
            .max_retry(3)
            .retry_delay(FixedDelay::new(Duration::from_secs(1)))
            .build();
        let coordinator = coordinator(mock);

        let mut current = envelope();
        for cycle in 1i64..=2 {
            let outcome = coordinator.settle(&task, &current, false).await.unwrap();
            assert_eq!(
                outcome,
                Disposition::Retried {
                    delay: Duration::from_secs(1)
                }
            );

            let (exchange, message) = published.lock().unwrap().last().unwrap().clone();
            assert_eq!(exchange, "orders.retry");

            current = Envelope::new(
                7,
                "orders",
                "orders.created",
                true,
                message.properties.clone(),
                message.payload.clone(),
            );
            assert_eq!(death_count(&current, ""), cycle);
        }

        let outcome = coordinator.settle(&task, &current, false).await.unwrap();
        assert_eq!(outcome, Disposition::Quarantined);

        let (exchange, message) = published.lock().unwrap().last().unwrap().clone();
        assert_eq!(exchange, "orders.failed");

        let quarantined = Envelope::new(
            7,
            "orders",
            "orders.created",
            true,
            message.properties.clone(),
            vec![],
        );
        assert_eq!(
            death_count(&quarantined, ""),
            2,
            "quarantine must not add a death record"
        );
    }
}
