// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides the types used to declare exchanges: the exchange
//! kind (including the delayed-message plugin kind) and a builder for the
//! declare-time options. The retry path derives exchange names at runtime,
//! so definitions own their data.

use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::BTreeMap;

/// Header field naming the routing kind a delayed exchange applies after the
/// delay elapses
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl ExchangeKind {
    /// The kind name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => "x-delayed-message",
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    /// Converts the internal ExchangeKind to lapin's ExchangeKind.
    ///
    /// The delayed kind maps to a custom exchange type provided by the
    /// delayed message exchange plugin.
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of an exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure
/// exchange definitions. It supports the standard exchange types as well as
/// the delayed-message plugin configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a Direct exchange with default
    /// parameters.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new exchange definition with default settings
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Makes this a delayed exchange that applies the given routing kind once
    /// a message's delay elapses.
    ///
    /// This requires the x-delayed-message plugin to be installed on the
    /// broker. `inner` should be one of the basic kinds.
    ///
    /// # Parameters
    /// * `inner` - The routing kind applied after the delay
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delayed(mut self, inner: ExchangeKind) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(inner.as_str())),
        );
        self
    }

    /// Sets the exchange parameters.
    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    /// Adds a single parameter to the exchange.
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Sets the no_wait flag, making the operation non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Whether this definition declares a delay-capable exchange.
    pub fn is_delayed(&self) -> bool {
        self.kind == ExchangeKind::XMessageDelayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_defaults_to_plain_direct() {
        let def = ExchangeDefinition::new("orders");

        assert_eq!(def.name, "orders");
        assert_eq!(def.kind, ExchangeKind::Direct);
        assert!(!def.durable);
        assert!(!def.passive);
        assert!(!def.delete);
        assert!(def.params.is_empty());
        assert!(!def.is_delayed());
    }

    #[test]
    fn delayed_definition_records_inner_kind() {
        let def = ExchangeDefinition::new("orders.wait").delayed(ExchangeKind::Fanout);

        assert_eq!(def.kind, ExchangeKind::XMessageDelayed);
        assert!(def.is_delayed());
        assert_eq!(
            def.params.get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            Some(&AMQPValue::LongString("fanout".into()))
        );
    }

    #[test]
    fn delayed_kind_maps_to_plugin_custom_type() {
        let kind: lapin::ExchangeKind = (&ExchangeKind::XMessageDelayed).into();

        assert_eq!(
            kind,
            lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
        );
        assert_eq!(
            lapin::ExchangeKind::from(&ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        );
    }
}
