// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Definitions
//!
//! A task ties a queue to the handler that processes it, together with the
//! retry budget and the exchanges used when a delivery fails for good. The
//! registry maps task names, as given on the command line, to their
//! definitions.

use crate::{
    exchange::ExchangeKind,
    handler::MessageHandler,
    retry::{DelayPolicy, FixedDelay},
};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// How failed deliveries are rescheduled.
pub struct RetryOptions {
    pub(crate) delay: Arc<dyn DelayPolicy>,
    pub(crate) exchange: Option<String>,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) routing_key: Option<String>,
}

impl Default for RetryOptions {
    fn default() -> RetryOptions {
        RetryOptions {
            delay: Arc::new(FixedDelay::new(Duration::ZERO)),
            exchange: None,
            exchange_kind: ExchangeKind::Fanout,
            routing_key: None,
        }
    }
}

/// Where deliveries land once their retries are exhausted.
pub struct FailedOptions {
    pub(crate) exchange: Option<String>,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) routing_key: Option<String>,
}

impl Default for FailedOptions {
    fn default() -> FailedOptions {
        FailedOptions {
            exchange: None,
            exchange_kind: ExchangeKind::Fanout,
            routing_key: None,
        }
    }
}

/// A consumable unit of work: one queue, one handler, one retry budget.
pub struct Task {
    pub(crate) queue: String,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) max_retry: u32,
    pub(crate) retry: RetryOptions,
    pub(crate) failed: FailedOptions,
}

impl Task {
    pub fn builder(queue: &str, handler: Arc<dyn MessageHandler>) -> TaskBuilder {
        TaskBuilder {
            queue: queue.to_owned(),
            handler,
            max_retry: 5,
            retry: RetryOptions::default(),
            failed: FailedOptions::default(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Total number of delivery attempts the task allows.
    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }
}

pub struct TaskBuilder {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    max_retry: u32,
    retry: RetryOptions,
    failed: FailedOptions,
}

impl TaskBuilder {
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn retry_delay(mut self, policy: impl DelayPolicy + 'static) -> Self {
        self.retry.delay = Arc::new(policy);
        self
    }

    pub fn retry_exchange(mut self, name: &str) -> Self {
        self.retry.exchange = Some(name.to_owned());
        self
    }

    pub fn retry_exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.retry.exchange_kind = kind;
        self
    }

    pub fn retry_routing_key(mut self, key: &str) -> Self {
        self.retry.routing_key = Some(key.to_owned());
        self
    }

    pub fn failed_exchange(mut self, name: &str) -> Self {
        self.failed.exchange = Some(name.to_owned());
        self
    }

    pub fn failed_exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.failed.exchange_kind = kind;
        self
    }

    pub fn failed_routing_key(mut self, key: &str) -> Self {
        self.failed.routing_key = Some(key.to_owned());
        self
    }

    /// A task always gets at least one attempt.
    pub fn build(self) -> Task {
        Task {
            queue: self.queue,
            handler: self.handler,
            max_retry: self.max_retry.max(1),
            retry: self.retry,
            failed: self.failed,
        }
    }
}

/// Named tasks available to the consumer command.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new() -> TaskRegistry {
        TaskRegistry::default()
    }

    pub fn register(mut self, name: &str, task: Task) -> Self {
        self.tasks.insert(name.to_owned(), Arc::new(task));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
