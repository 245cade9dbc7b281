// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Death History
//!
//! Readers and writers for the `x-death` header, the broker-maintained
//! record of every time a message was dead-lettered. The retry flow uses it
//! to count how many times a delivery has already failed and to stamp a new
//! failure before republishing.
//!
//! Records written by the broker itself are preserved byte for byte; only
//! the record matching the reason being updated is re-encoded.

use crate::envelope::Envelope;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use std::time::{SystemTime, UNIX_EPOCH};

pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
pub const AMQP_HEADERS_COUNT: &str = "count";
pub const REASON_REJECTED: &str = "rejected";

/// One entry of the `x-death` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub count: i64,
    pub exchange: String,
    pub queue: String,
    pub reason: String,
    pub routing_keys: Vec<String>,
    pub time: u64,
}

impl DeathRecord {
    /// Decodes a record from its header table.
    ///
    /// Broker implementations disagree on the integer width used for
    /// `count`, so any integer value is accepted. Missing or unexpected
    /// fields decode to their zero values.
    pub fn decode(table: &FieldTable) -> DeathRecord {
        let fields = table.inner();

        let routing_keys = match fields.get("routing-keys") {
            Some(AMQPValue::FieldArray(keys)) => keys
                .as_slice()
                .iter()
                .map(|key| string_value(Some(key)))
                .collect(),
            _ => vec![],
        };

        DeathRecord {
            count: int_value(fields.get(AMQP_HEADERS_COUNT)),
            exchange: string_value(fields.get("exchange")),
            queue: string_value(fields.get("queue")),
            reason: string_value(fields.get("reason")),
            routing_keys,
            time: int_value(fields.get("time")).max(0) as u64,
        }
    }

    /// Encodes the record back into its header representation.
    pub fn encode(&self) -> AMQPValue {
        let mut table = FieldTable::default();

        table.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(self.count),
        );
        table.insert(
            ShortString::from("exchange"),
            AMQPValue::LongString(LongString::from(self.exchange.clone())),
        );
        table.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from(self.queue.clone())),
        );
        table.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from(self.reason.clone())),
        );
        table.insert(
            ShortString::from("routing-keys"),
            AMQPValue::FieldArray(FieldArray::from(
                self.routing_keys
                    .iter()
                    .map(|key| AMQPValue::LongString(LongString::from(key.clone())))
                    .collect::<Vec<AMQPValue>>(),
            )),
        );
        table.insert(
            ShortString::from("time"),
            AMQPValue::Timestamp(self.time),
        );

        AMQPValue::FieldTable(table)
    }
}

/// Returns the decoded death history of the message, newest first.
///
/// Entries that are not tables are skipped.
pub fn death_history(envelope: &Envelope) -> Vec<DeathRecord> {
    match envelope.header(AMQP_HEADERS_X_DEATH) {
        Some(AMQPValue::FieldArray(records)) => records
            .as_slice()
            .iter()
            .filter_map(|record| record.as_field_table().map(DeathRecord::decode))
            .collect(),
        _ => vec![],
    }
}

/// Returns how many times the message died for the given reason.
///
/// With an empty reason the count of the most recent death is returned,
/// whatever its reason. A message that never died counts zero.
pub fn death_count(envelope: &Envelope, reason: &str) -> i64 {
    let history = death_history(envelope);

    if reason.is_empty() {
        return history.first().map(|record| record.count).unwrap_or(0);
    }

    history
        .iter()
        .find(|record| record.reason == reason)
        .map(|record| record.count)
        .unwrap_or(0)
}

/// Stamps one more death for the given reason and returns the headers to
/// republish with.
///
/// An existing record for the reason is moved to the front with its count
/// incremented and its time refreshed, whichever queue it names; otherwise a
/// new record with count one is prepended, naming `queue` as where the death
/// happened. Every other header, and every other death record, is carried
/// over untouched.
pub fn record_death(envelope: &Envelope, reason: &str, queue: &str) -> FieldTable {
    let mut headers = envelope.headers().cloned().unwrap_or_default();

    let mut records: Vec<AMQPValue> = match headers.inner().get(AMQP_HEADERS_X_DEATH) {
        Some(AMQPValue::FieldArray(records)) => records.as_slice().to_vec(),
        _ => vec![],
    };

    let mut matched: Option<(usize, DeathRecord)> = None;
    for (position, entry) in records.iter().enumerate() {
        if let Some(table) = entry.as_field_table() {
            let record = DeathRecord::decode(table);
            if record.reason == reason {
                matched = Some((position, record));
                break;
            }
        }
    }

    let record = match matched {
        Some((position, mut record)) => {
            records.remove(position);
            record.count += 1;
            record.time = epoch_seconds();
            record
        }
        None => DeathRecord {
            count: 1,
            exchange: envelope.exchange().to_owned(),
            queue: queue.to_owned(),
            reason: reason.to_owned(),
            routing_keys: vec![envelope.routing_key().to_owned()],
            time: epoch_seconds(),
        },
    };

    records.insert(0, record.encode());

    headers.insert(
        ShortString::from(AMQP_HEADERS_X_DEATH),
        AMQPValue::FieldArray(FieldArray::from(records)),
    );

    headers
}

fn int_value(value: Option<&AMQPValue>) -> i64 {
    match value {
        Some(AMQPValue::LongLongInt(value)) => *value,
        Some(AMQPValue::LongInt(value)) => i64::from(*value),
        Some(AMQPValue::ShortInt(value)) => i64::from(*value),
        Some(AMQPValue::ShortShortInt(value)) => i64::from(*value),
        Some(AMQPValue::LongUInt(value)) => i64::from(*value),
        Some(AMQPValue::ShortUInt(value)) => i64::from(*value),
        Some(AMQPValue::ShortShortUInt(value)) => i64::from(*value),
        Some(AMQPValue::Timestamp(value)) => *value as i64,
        _ => 0,
    }
}

fn string_value(value: Option<&AMQPValue>) -> String {
    match value {
        Some(AMQPValue::LongString(value)) => {
            String::from_utf8_lossy(value.as_bytes()).to_string()
        }
        Some(AMQPValue::ShortString(value)) => value.to_string(),
        _ => String::new(),
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
