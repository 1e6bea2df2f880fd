//! Leasehold CLI
//!
//! Runs a command while holding a distributed lease, so that at most one
//! copy runs at a time across every machine sharing the lease store.

mod commands;
mod config;
mod store_factory;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LeaseholdConfig;

/// Run commands under a distributed lease.
#[derive(Parser, Debug)]
#[command(name = "leasehold", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        env = "LEASEHOLD_CONFIG",
        default_value = "leasehold.toml",
        global = true
    )]
    config: PathBuf,

    /// Override the store backend (only `redis` is shared across processes).
    #[arg(long, env = "LEASEHOLD_BACKEND", global = true)]
    backend: Option<String>,

    /// Override the Redis connection URL.
    #[arg(long, env = "LEASEHOLD_REDIS_URL", global = true)]
    redis_url: Option<String>,

    /// Override the key prefix.
    #[arg(long, env = "LEASEHOLD_PREFIX", global = true)]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command while holding a lease.
    Run(commands::run::RunArgs),
    /// Release a lease by its holder token.
    Release(commands::release::ReleaseArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = LeaseholdConfig::load(&cli.config)?;
    if let Some(backend) = cli.backend {
        config.store.backend = backend;
    }
    if cli.redis_url.is_some() {
        config.store.url = cli.redis_url;
    }
    if cli.prefix.is_some() {
        config.store.prefix = cli.prefix;
    }

    let store = store_factory::create_store(&config.store)?;

    let code = match cli.command {
        Command::Run(args) => commands::run::run(store, &config.lease, &args).await?,
        Command::Release(args) => commands::release::run(store, &args).await?,
    };
    std::process::exit(code);
}
