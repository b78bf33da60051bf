//! Hostwatch Agent - scheduled host checks with batched reporting
//!
//! - Cron-scheduled checks (server loads, network, own process, files)
//! - Results batched into report sinks, or forwarded to a hostwatch-server
//! - Watchdog aborting the process when the scheduler stalls

use anyhow::{Context, Result};
use clap::Parser;
use hostwatch_agent::checks::builtin_registry;
use hostwatch_agent::{Agent, HostwatchConfig, SignalAbort, WatchdogMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostwatch-agent", version, about = "Host monitoring agent")]
struct Args {
    /// Main configuration file (default: $HOSTWATCH_CONFIG, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Forward results to this collector URL instead of local sinks
    #[arg(long)]
    forward: Option<String>,

    /// -v debug, -vv trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Extra task files merged into `objects`, in order
    task_files: Vec<PathBuf>,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("hostwatch_agent={level}").parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let path = HostwatchConfig::resolve_path(args.config.as_deref())
        .context("no configuration file given")?;
    info!(config = %path.display(), "hostwatch agent starting");

    let mut agent = Agent::from_files(path, args.task_files, builtin_registry(), Arc::new(SignalAbort)).await?;
    if let Some(url) = args.forward {
        agent = agent.forward_to(url);
    }

    let shutdown = agent.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, stopping");
                shutdown.trigger();
            }
            Err(e) => error!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    let summary = agent.run().await.context("agent failed")?;
    if summary.watchdog == WatchdogMode::Panic {
        anyhow::bail!("watchdog escalated after {} passes", summary.passes);
    }
    Ok(())
}
