// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! This module provides an owned, broker-independent view of a single
//! delivery. The envelope keeps everything the retry path needs (delivery
//! tag, source exchange, routing key, properties, body) without holding any
//! channel state, so the death ledger and message handlers can be exercised
//! without a broker.

use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable},
    BasicProperties,
};

/// A single delivered message, detached from the channel that delivered it.
///
/// Acknowledgement is addressed by delivery tag through the channel that
/// produced the envelope; the tag is meaningless on any other channel.
#[derive(Debug, Clone)]
pub struct Envelope {
    delivery_tag: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: BasicProperties,
    body: Vec<u8>,
}

impl Envelope {
    /// Creates an envelope from its parts.
    ///
    /// Deliveries taken from a broker are converted with `From<Delivery>`
    /// instead; this constructor exists for code that needs to fabricate a
    /// message, such as handler tests.
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Self {
        Envelope {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            body,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// The exchange the message was originally published to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// The full property set the message arrived with. Republishing carries
    /// these through untouched unless the retry path rewrites headers.
    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns the header table, if the message carries one.
    pub fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    /// Looks up a single header by name.
    pub fn header(&self, name: &str) -> Option<&AMQPValue> {
        self.headers().and_then(|table| table.inner().get(name))
    }
}

impl From<Delivery> for Envelope {
    fn from(delivery: Delivery) -> Self {
        Envelope {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn header_lookup_finds_named_entry() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("x-origin"),
            AMQPValue::LongString("billing".into()),
        );
        let props = BasicProperties::default().with_headers(table);
        let envelope = Envelope::new(1, "orders", "orders.created", false, props, vec![]);

        assert_eq!(
            envelope.header("x-origin"),
            Some(&AMQPValue::LongString("billing".into()))
        );
        assert_eq!(envelope.header("x-missing"), None);
    }

    #[test]
    fn header_lookup_without_header_table_is_none() {
        let envelope = Envelope::new(
            7,
            "orders",
            "orders.created",
            true,
            BasicProperties::default(),
            b"{}".to_vec(),
        );

        assert!(envelope.headers().is_none());
        assert_eq!(envelope.header("x-death"), None);
        assert_eq!(envelope.delivery_tag(), 7);
        assert!(envelope.redelivered());
    }
}
