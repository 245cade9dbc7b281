// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The trait application code implements to process deliveries.

use crate::envelope::Envelope;
use async_trait::async_trait;

/// Anything a handler wants to surface as a failure.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one delivery at a time.
///
/// Returning `Err` marks the delivery as failed and hands it to the retry
/// flow; panics are caught by the consumer and treated the same way. The
/// death count tells the handler how many times this message already failed,
/// zero on the first attempt.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, death_count: i64) -> Result<(), HandlerError>;
}
