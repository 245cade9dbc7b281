// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for AMQP Operations
//!
//! This module provides the error type shared by every broker-facing operation
//! in the crate. The `AmqpError` enum covers connection and channel setup,
//! exchange and queue declarations, publishing, and the consumption path.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the operation that failed and, where useful, the
/// exchange, queue, or consumer involved. Handler-level failures are not
/// represented here; they are reported through the handler's own error type
/// and settled by the retry coordinator.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QosError(String),

    /// Error publishing a message to the given exchange
    #[error("failure to publish to exchange `{0}`")]
    PublishError(String),

    /// Publishing was attempted before any exchange was declared
    #[error("no exchange bound, declare one before publishing")]
    ExchangeNotDeclared,

    /// Delayed publishing was attempted on an exchange of the wrong kind
    #[error("exchange `{0}` does not support delayed publishing")]
    InvalidExchangeKind(String),

    /// Error starting or driving a consumer on the given queue
    #[error("failure to consume from queue `{0}`")]
    ConsumerError(String),

    /// Error cancelling the consumer with the given tag
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error fetching a single message from the given queue
    #[error("failure to get message from queue `{0}`")]
    GetMessageError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Invalid or unreadable configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}
