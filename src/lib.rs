// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod death;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod task;
