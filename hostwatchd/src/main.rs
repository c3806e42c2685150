use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hostwatchd::{
    ConfigSource, LogEvent, ServiceContext, ServiceController, DEFAULT_QUEUE_CAPACITY,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostwatchd", version)]
#[command(about = "hostwatch agent: periodic directory reports and a serial command runner")]
struct Cli {
    /// Path to the agent configuration (hostwatch.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of commands waiting for the worker
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Explicit tracing filter (overrides --debug and RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    info!(
        built = hostwatch_build_info::build_timestamp(),
        git = hostwatch_build_info::git_label(),
        "{}",
        hostwatch_build_info::formatted_banner("hostwatchd", env!("CARGO_PKG_VERSION"))
    );

    let source = ConfigSource::discover(cli.config);
    info!(?source, "Using configuration");

    let controller = ServiceController::builder(source)
        .queue_capacity(cli.queue_capacity)
        .build();
    tokio::spawn(dump_on_refresh(Arc::clone(controller.context())));

    controller
        .start()
        .await
        .context("failed to start hostwatch service")?;
    controller.wait_until_stopped().await;

    info!("hostwatchd exiting");
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None if cli.debug => EnvFilter::new("debug"),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

/// Prints the whole journal to stdout whenever a `logs` command asks for it.
async fn dump_on_refresh(ctx: Arc<ServiceContext>) {
    let mut feed = ctx.log().subscribe();
    loop {
        match feed.recv().await {
            Ok(LogEvent::RefreshRequested) => {
                let mut stdout = io::stdout().lock();
                for line in ctx.log().snapshot() {
                    if writeln!(stdout, "{}", line).is_err() {
                        break;
                    }
                }
                let _ = stdout.flush();
            }
            Ok(LogEvent::Appended(_)) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Journal feed lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
