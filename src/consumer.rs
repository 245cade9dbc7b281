// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Loop
//!
//! Drives a task's queue: waits for deliveries one at a time, invokes the
//! task handler, and settles every delivery through the retry flow. Handler
//! errors and panics are contained here and downgraded to a failed outcome;
//! broker faults end the loop and surface to the caller, which decides
//! whether to start it again.

use crate::{
    channel::{BrokerChannel, ConnectionManager},
    config::AmqpConfig,
    death,
    envelope::Envelope,
    errors::AmqpError,
    handler::MessageHandler,
    otel,
    queue::{Queue, QueueDefinition, ReadOutcome, Subscription},
    retry::{Disposition, RetryCoordinator},
    task::Task,
};
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Runs one task's consumer against the shared connection.
pub struct ConsumerLoop {
    manager: Arc<ConnectionManager>,
}

impl ConsumerLoop {
    pub fn new(manager: Arc<ConnectionManager>) -> ConsumerLoop {
        ConsumerLoop { manager }
    }

    /// Consumes the task's queue until the subscription ends.
    ///
    /// An elapsed read timeout and a broker-side cancel are both normal
    /// ends and return `Ok`. Broker faults propagate so the caller can
    /// decide whether to start over with a fresh channel.
    pub async fn run(&self, task: &Task) -> Result<(), AmqpError> {
        let channel = self.manager.channel().await?;
        run_on(channel, task, self.manager.config()).await
    }
}

async fn run_on(
    channel: Arc<dyn BrokerChannel>,
    task: &Task,
    config: &AmqpConfig,
) -> Result<(), AmqpError> {
    let queue = Queue::declare(
        channel.clone(),
        &QueueDefinition::new(task.queue()).passive(),
    )
    .await?;
    channel.qos(1).await?;

    let consumer_tag = format!("{}-{}", task.queue(), Uuid::new_v4());
    let mut subscription = queue.consume(&consumer_tag, config.read_timeout()).await?;

    let coordinator = RetryCoordinator::new(channel, config);
    let tracer = global::tracer("amqp consumer");

    debug!(
        queue = task.queue(),
        tag = subscription.consumer_tag(),
        "consuming"
    );

    loop {
        match subscription.next().await {
            Ok(ReadOutcome::Delivered(envelope)) => {
                let deaths = death::death_count(&envelope, "");
                let (_, mut span) = otel::new_span(envelope.properties(), &tracer, task.queue());

                debug!(
                    queue = task.queue(),
                    exchange = envelope.exchange(),
                    "received a delivery"
                );

                let handled = invoke_handler(task.handler.as_ref(), &envelope, deaths).await;

                match coordinator.settle(task, &envelope, handled).await {
                    Ok(Disposition::Completed) => span.set_status(Status::Ok),
                    Ok(Disposition::Retried { .. }) | Ok(Disposition::Rejected) => {
                        span.set_status(Status::Error {
                            description: Cow::from("handler failed, delivery rescheduled"),
                        });
                    }
                    Ok(Disposition::Quarantined) => {
                        span.set_status(Status::Error {
                            description: Cow::from("retries exhausted, delivery quarantined"),
                        });
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "failure to settle the delivery");
                        span.record_error(&err);
                        span.set_status(Status::Error {
                            description: Cow::from("failure to settle the delivery"),
                        });
                        cancel_quietly(&subscription).await;
                        return Err(err);
                    }
                }
            }
            Ok(ReadOutcome::TimedOut) => {
                debug!(queue = task.queue(), "no deliveries within the read timeout");
                cancel_quietly(&subscription).await;
                return Ok(());
            }
            Ok(ReadOutcome::Cancelled) => {
                debug!(queue = task.queue(), "consumer cancelled");
                return Ok(());
            }
            Err(err) => {
                error!(error = err.to_string(), "failure while consuming");
                cancel_quietly(&subscription).await;
                return Err(err);
            }
        }
    }
}

/// Runs the handler, containing errors and panics.
async fn invoke_handler(handler: &dyn MessageHandler, envelope: &Envelope, deaths: i64) -> bool {
    match AssertUnwindSafe(handler.handle(envelope, deaths))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!(error = err.to_string(), "handler returned an error");
            false
        }
        Err(panic) => {
            error!(error = panic_message(&panic), "handler panicked");
            false
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_owned();
    }

    match panic.downcast_ref::<String>() {
        Some(message) => message.clone(),
        None => "unknown panic".to_owned(),
    }
}

async fn cancel_quietly(subscription: &Subscription) {
    if let Err(err) = subscription.cancel().await {
        warn!(error = err.to_string(), "failure to cancel the consumer");
    }
}
