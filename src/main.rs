use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::identity::{KeyResolver, SubjectKeyResolver};
use turnstile::ratelimit::LimiterRegistry;

/// Decide admission for subjects read from stdin, one per line.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// YAML configuration file; `TURNSTILE__*` environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print one JSON object per decision
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct DecisionLine<'a> {
    key: &'a str,
    allowed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = TurnstileConfig::load(args.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Turnstile admission checker");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(algorithm = %config.limiter.algorithm, "Configuration loaded");

    let registry = Arc::new(LimiterRegistry::new(
        config.limiter.clone(),
        &config.registry,
    )?);
    let eviction = registry.spawn_eviction()?;
    let resolver = SubjectKeyResolver::new(config.registry.default_key.clone());

    tokio::select! {
        result = run(&registry, &resolver, args.json) => result?,
        _ = shutdown_signal() => {}
    }

    eviction.stop();
    registry.shutdown();
    info!("Turnstile stopped");
    Ok(())
}

async fn run(
    registry: &LimiterRegistry,
    resolver: &impl KeyResolver,
    json: bool,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let key = resolver.resolve_key(Some(&line));
        let allowed = registry.check(&key);

        let output = if json {
            serde_json::to_string(&DecisionLine { key: &key, allowed })?
        } else {
            format!("{} {}", key, if allowed { "allow" } else { "deny" })
        };
        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    // Logs go to stderr so stdout carries only decisions.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
