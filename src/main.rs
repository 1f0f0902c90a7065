//! WireStorm v1.0 — Programmable TCP Fault-Injection Proxy
//! پراکسی تزریق خطای شبکه برای تست مقاومت سرویس‌ها
//!
//! Data plane: accept → session → paired upstream, with deterministic
//! per-packet fault decisions. Control plane: small HTTP API for
//! profiles, sessions, metrics and health.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use wirestorm::blackbox::{self, BlackBoxLayer};
use wirestorm::config::{load_config_file, split_host_port};
use wirestorm::types::ServerConfig;
use wirestorm::{AnomalyEngine, ConfigManager, ControlServer, ProxyServer, Scheduler, SessionManager};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "wirestorm",
    version = "1.0.0",
    about = "⚡ WireStorm — programmable TCP fault-injection proxy",
    long_about = "Ferries TCP byte streams through per-direction fault profiles \
                  (latency, jitter, drop, corrupt, stall, half-close, throttle).\n\
                  Profiles are updated at runtime via the HTTP control API; all \
                  fault decisions are deterministic for a given seed."
)]
struct Cli {
    /// Listen address (host:port)
    #[arg(long)]
    listen: Option<String>,

    /// Upstream target (host:port)
    #[arg(long)]
    upstream: Option<String>,

    /// Control API port
    #[arg(long)]
    control: Option<u16>,

    /// Global RNG seed (0 = random)
    #[arg(long)]
    seed: Option<u64>,

    /// Optional TOML config file; CLI flags win
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

// ── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let server_config = build_config(&cli)?;
    banner(&server_config);

    let config = Arc::new(ConfigManager::new(server_config));
    let engine = AnomalyEngine::new(config.server_config().global_seed);
    let scheduler = Scheduler::new();
    let manager = SessionManager::new(engine, Arc::clone(&config), scheduler.clone());

    let proxy = ProxyServer::new(Arc::clone(&manager), Arc::clone(&config));
    proxy.start().await.context("starting proxy server")?;

    let control = ControlServer::new(Arc::clone(&config), Arc::clone(&manager));
    control
        .start(config.server_config().control_port)
        .await
        .context("starting control server")?;

    info!("✅ WireStorm is up — Ctrl+C to stop");
    wait_for_shutdown().await?;

    // stop accepting, drain gracefully, then hard-close stragglers
    info!("🛑 shutting down");
    proxy.stop();
    control.stop();
    manager.shutdown_all();
    tokio::time::sleep(config.server_config().min_linger).await;
    manager.force_close_all();
    scheduler.cancel_all();

    blackbox::dump();
    info!("🔌 WireStorm stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = term.recv() => info!("SIGTERM received"),
    }
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(filter),
        )
        // the flight recorder always sees DEBUG, whatever the console shows
        .with(BlackBoxLayer.with_filter(LevelFilter::DEBUG))
        .init();
}

fn build_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = ServerConfig::default();

    if let Some(path) = &cli.config {
        if path.exists() {
            load_config_file(&mut config, path)?;
        }
    }

    if let Some(listen) = &cli.listen {
        let (host, port) = split_host_port(listen, config.listen_port)?;
        config.listen_host = host;
        config.listen_port = port;
    }
    if let Some(upstream) = &cli.upstream {
        let (host, port) = split_host_port(upstream, config.upstream_port)?;
        config.upstream_host = host;
        config.upstream_port = port;
    }
    if let Some(control) = cli.control {
        config.control_port = control;
    }
    if let Some(seed) = cli.seed {
        config.global_seed = seed;
    }
    if config.global_seed == 0 {
        config.global_seed = rand::random();
    }

    Ok(config)
}

fn banner(config: &ServerConfig) {
    println!("{}", "═".repeat(60).cyan());
    println!(
        "  {} {}",
        "⚡ WireStorm v1.0".bold().cyan(),
        "— TCP fault-injection proxy".dimmed()
    );
    println!("{}", "═".repeat(60).cyan());
    println!("  Listen:   {}:{}", config.listen_host, config.listen_port);
    println!("  Upstream: {}:{}", config.upstream_host, config.upstream_port);
    println!("  Control:  http://localhost:{}", config.control_port);
    println!("  Seed:     {}", config.global_seed);
    println!();
    println!("  {}", "Examples:".bold());
    println!("  curl http://localhost:{}/health", config.control_port);
    println!("  curl http://localhost:{}/metrics", config.control_port);
    println!(
        "  curl -X POST http://localhost:{}/profiles/default -d '{{\"latency_ms\":100}}'",
        config.control_port
    );
    println!("{}", "═".repeat(60).cyan());
}
