// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Publishing
//!
//! This module provides the publishing surface of the crate. A publisher is
//! bound to one exchange at a time: it declares the exchange first, then
//! publishes messages to it. Delayed publishing is only available on an
//! exchange that was declared delay-capable; the delay travels in the
//! `x-delay` header, in milliseconds, as the delayed message exchange plugin
//! expects.

use crate::{
    channel::BrokerChannel,
    envelope::Envelope,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
};
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, ShortString},
    BasicProperties,
};
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// Header field carrying a message's delay in milliseconds on a delayed
/// exchange
pub const AMQP_HEADERS_DELAY: &str = "x-delay";

/// A message ready to be published.
///
/// Messages are published with the mandatory flag set by default, so the
/// broker returns them instead of dropping them silently when no queue is
/// bound to the routing key.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub(crate) routing_key: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) properties: BasicProperties,
    pub(crate) mandatory: bool,
}

impl OutgoingMessage {
    /// Creates a message with default properties.
    ///
    /// # Parameters
    /// * `routing_key` - The routing key to publish with
    /// * `payload` - The message body
    ///
    /// # Returns
    /// A new outgoing message with default settings
    pub fn new(routing_key: &str, payload: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage {
            routing_key: routing_key.to_owned(),
            payload,
            properties: BasicProperties::default(),
            mandatory: true,
        }
    }

    /// Replaces the message properties.
    pub fn properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Replaces the routing key.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Clears the mandatory flag, letting the broker drop unroutable
    /// messages.
    pub fn not_mandatory(mut self) -> Self {
        self.mandatory = false;
        self
    }
}

impl From<&Envelope> for OutgoingMessage {
    /// Builds a republishable copy of a delivered message: same routing key,
    /// same body, the full property set carried through.
    fn from(envelope: &Envelope) -> Self {
        OutgoingMessage {
            routing_key: envelope.routing_key().to_owned(),
            payload: envelope.body().to_vec(),
            properties: envelope.properties().clone(),
            mandatory: true,
        }
    }
}

/// A declare-then-publish handle bound to a single exchange.
///
/// Publishing before `declare` fails with `ExchangeNotDeclared` before any
/// broker call is made; delayed publishing additionally requires the bound
/// exchange to have been declared delay-capable.
pub struct ExchangePublisher {
    channel: Arc<dyn BrokerChannel>,
    exchange: Option<ExchangeDefinition>,
}

impl ExchangePublisher {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> ExchangePublisher {
        ExchangePublisher {
            channel,
            exchange: None,
        }
    }

    /// Declares the exchange on the broker and binds this publisher to it.
    ///
    /// Declaring an exchange that already exists with different properties
    /// surfaces the broker's channel-level conflict as a declare error; it is
    /// never silently ignored.
    ///
    /// # Parameters
    /// * `def` - The exchange definition
    ///
    /// # Returns
    /// Self for call chaining, or the declare error
    pub async fn declare(&mut self, def: ExchangeDefinition) -> Result<&mut Self, AmqpError> {
        self.channel.declare_exchange(&def).await?;

        debug!(exchange = def.name.as_str(), "publisher bound to exchange");
        self.exchange = Some(def);

        Ok(self)
    }

    /// Declares a durable delay-capable exchange and binds this publisher to
    /// it.
    ///
    /// # Parameters
    /// * `name` - The exchange name
    /// * `inner` - The routing kind applied once a message's delay elapses
    ///
    /// # Returns
    /// Self for call chaining, or the declare error
    pub async fn declare_delayed(
        &mut self,
        name: &str,
        inner: ExchangeKind,
    ) -> Result<&mut Self, AmqpError> {
        self.declare(ExchangeDefinition::new(name).durable().delayed(inner))
            .await
    }

    /// The exchange this publisher is currently bound to, if any.
    pub fn exchange(&self) -> Option<&str> {
        self.exchange.as_ref().map(|def| def.name.as_str())
    }

    /// Publishes a message to the bound exchange.
    pub async fn publish(&self, message: &OutgoingMessage) -> Result<(), AmqpError> {
        let Some(def) = self.exchange.as_ref() else {
            return Err(AmqpError::ExchangeNotDeclared);
        };

        self.channel.publish(&def.name, message).await
    }

    /// Publishes a message that becomes routable only after the given delay.
    ///
    /// Fails with `InvalidExchangeKind` before any broker call when the bound
    /// exchange was not declared delay-capable.
    ///
    /// # Parameters
    /// * `delay` - How long the broker holds the message back
    /// * `message` - The message to publish
    pub async fn publish_delayed(
        &self,
        delay: Duration,
        message: &OutgoingMessage,
    ) -> Result<(), AmqpError> {
        let Some(def) = self.exchange.as_ref() else {
            return Err(AmqpError::ExchangeNotDeclared);
        };
        if !def.is_delayed() {
            return Err(AmqpError::InvalidExchangeKind(def.name.clone()));
        }

        let mut headers = message
            .properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_DELAY),
            AMQPValue::LongLongInt(delay.as_millis() as LongLongInt),
        );

        let delayed = message.clone().properties(
            message
                .properties
                .clone()
                .with_headers(FieldTable::from(headers)),
        );

        self.channel.publish(&def.name, &delayed).await
    }
}
