//! Hostwatch Server - central ingest for results forwarded by agents
//!
//! Agents in forwarding mode POST every result to `/api/agent`. The server
//! keeps the latest event per (hostname, source) for the REST API and feeds
//! each result into its own collector, so the same sinks and publish
//! thresholds apply as on a standalone agent.

mod config;
mod health;
mod http;
mod models;

use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::models::EventsMap;
use anyhow::{Context, Result};
use clap::Parser;
use hostwatch_agent::collector::{result_queue, Collector, SinkRegistry};
use hostwatch_agent::state::{new_state, Shutdown};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostwatch-server", version, about = "Hostwatch result ingest server")]
struct Args {
    /// Server configuration (default: $HOSTWATCH_SERVER_CONFIG, then ./server.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listen`
    #[arg(short, long)]
    listen: Option<String>,

    /// -v debug, -vv trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let mut filter = EnvFilter::from_default_env();
    for target in ["hostwatch_server", "hostwatch_agent"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.verbose);

    let mut cfg = load_config(args.config.as_deref()).await?;
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if cfg.token.is_none() {
        warn!("no api token configured, /api/agent accepts any client");
    }

    let shutdown = Shutdown::new();
    let (queue, rx) = result_queue();
    let (_thresholds_tx, thresholds) = watch::channel(cfg.collector.thresholds);
    let collector = Collector::new(
        rx,
        SinkRegistry::builtin().build(&cfg.collector.sinks),
        thresholds,
        cfg.collector.idle_period(),
        shutdown.clone(),
    );
    let collector_task = tokio::spawn(collector.run());

    let app_state = AppState {
        events: new_state(EventsMap::new()),
        queue,
        token: cfg.token.clone(),
        stale_after: chrono::Duration::seconds(cfg.stale_after as i64),
        health: HealthTracker::new(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("cannot listen on {}", cfg.listen))?;
    info!(addr = %cfg.listen, "hostwatch server listening");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping");
                signal.trigger();
            }
            Err(e) => error!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.wait().await })
        .await
        .context("http server failed")?;

    shutdown.trigger();
    let stats = collector_task.await.context("collector task failed")?;
    info!(
        received = stats.received,
        publishes = stats.publishes,
        sink_errors = stats.sink_errors,
        "hostwatch server stopped"
    );
    Ok(())
}
