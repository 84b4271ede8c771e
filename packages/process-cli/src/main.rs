//! Replays lifecycle events through the process engine.
//!
//! Reads a fixture (see [`replay`]), runs its events against an in-memory
//! store and prints the produced transactions as JSON on stdout. Logs go to
//! stderr.

mod replay;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use process_engine::{EngineBuilder, EngineConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::replay::{ReplayFixture, ReplayOptions};

#[derive(Parser)]
#[command(name = "process-replay")]
#[command(about = "Replay lifecycle events through the process engine")]
struct Cli {
    /// Fixture file with documents, removed snapshots and events
    fixture: PathBuf,

    /// Seed for the Random transform (overrides PROCESS_RANDOM_SEED)
    #[arg(long)]
    seed: Option<u64>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    /// Apply produced transactions and feed them back until nothing more happens
    #[arg(long)]
    settle: bool,

    /// Give up settling after this many rounds
    #[arg(long, default_value_t = 16)]
    max_rounds: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,process_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env().context("Failed to load configuration")?;
    if let Some(seed) = cli.seed {
        config = config.with_random_seed(seed);
    }

    let mut fixture = ReplayFixture::load(&cli.fixture)?;
    let store = Arc::new(fixture.store());
    let events = std::mem::take(&mut fixture.events);
    tracing::info!(
        documents = store.len(),
        events = events.len(),
        "fixture loaded"
    );

    let engine = EngineBuilder::new(store.clone()).with_config(config).build();
    let options = ReplayOptions {
        settle: cli.settle,
        max_rounds: cli.max_rounds,
    };
    let report = replay::run(&engine, &store, events, options).await?;

    let output = if cli.pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    }
    .context("Failed to encode report")?;
    println!("{}", output);

    Ok(())
}
