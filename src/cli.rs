// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Command
//!
//! The command-line front of the crate. A binary embedding it registers its
//! tasks, loads a configuration, and hands both to [`run`], which parses the
//! arguments and keeps the requested consumer running. Supervision beyond
//! the restart pause stays with the operating environment.

use crate::{
    channel::ConnectionManager, config::AmqpConfig, consumer::ConsumerLoop, task::TaskRegistry,
};
use clap::{Parser, Subcommand};
use std::{process::ExitCode, sync::Arc, time::Duration};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const RESTART_PAUSE: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "requeue", version, about = "Queue consumer with bounded retry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consumes a registered task's queue until stopped.
    Consume {
        /// Name of the task to run.
        task: String,
    },
}

/// Parses the command line and runs the requested task's consumer.
///
/// Exits with 1 when no tasks were registered and 2 when the named task is
/// unknown. A running consumer is restarted after every ended run, with a
/// short pause in between, so a healthy process never returns.
pub async fn run(config: AmqpConfig, registry: TaskRegistry) -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Consume { task } => ExitCode::from(consume(&task, config, registry).await),
    }
}

async fn consume(name: &str, config: AmqpConfig, registry: TaskRegistry) -> u8 {
    if registry.is_empty() {
        error!("no tasks registered");
        return 1;
    }

    let task = match registry.get(name) {
        Some(task) => task,
        None => {
            error!(task = name, "unknown task");
            return 2;
        }
    };

    let manager = Arc::new(ConnectionManager::new(config));
    let consumer = ConsumerLoop::new(manager);

    loop {
        if let Err(err) = consumer.run(task.as_ref()).await {
            error!(
                error = err.to_string(),
                task = name,
                "consumer stopped with an error"
            );
        }

        tokio::time::sleep(RESTART_PAUSE).await;
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init()
        .ok();
}
