//! hostwatchctl
//!
//! Command-line front end for a running hostwatch agent.

use std::future::Future;
use std::io;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hostwatchd_client::{ControlClient, DEFAULT_URL};
use tokio::signal;
use tokio::time::sleep;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hostwatchctl", version)]
#[command(about = "Control a running hostwatch agent")]
struct Cli {
    /// Base URL of the agent control API
    #[arg(long, default_value = DEFAULT_URL)]
    url: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show worker and timer status
    Health,
    /// Print the agent journal
    Logs {
        /// Keep polling and print new lines as they appear
        #[arg(long)]
        follow: bool,
        /// Poll interval in milliseconds when following
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Queue a shell command on the agent
    Run {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Ask the agent to stop
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(io::stderr)
        .init();

    let client = ControlClient::new(&cli.url).context("failed to build HTTP client")?;

    match cli.command {
        Command::Health => {
            let health = client
                .health()
                .await
                .with_context(|| format!("health check against {} failed", client.base_url()))?;
            println!("worker: {}", health.worker);
            println!("timer:  {}", health.timer);
            if !health.all_running() {
                bail!("agent is degraded");
            }
        }
        Command::Logs {
            follow,
            interval_ms,
        } => {
            if follow {
                let interval = Duration::from_millis(interval_ms.max(50));
                follow_logs(&client, interval, async {
                    let _ = signal::ctrl_c().await;
                })
                .await?;
            } else {
                for line in client.logs().await.context("failed to fetch logs")? {
                    println!("{}", line);
                }
            }
        }
        Command::Run { command } => {
            let command = command.join(" ");
            let reply = client
                .add_command(&command)
                .await
                .with_context(|| format!("failed to queue `{}`", command))?;
            println!("{}", reply);
        }
        Command::Stop => {
            let reply = client.stop().await.context("failed to request stop")?;
            println!("{}", reply);
        }
    }

    Ok(())
}

/// Polls the journal and prints lines not shown yet, until `shutdown`
/// resolves. `shutdown` is watched during fetches as well as between them.
async fn follow_logs<F>(client: &ControlClient, interval: Duration, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut printed = 0usize;
    loop {
        let fetched = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            fetched = client.logs() => fetched,
        };
        match fetched {
            Ok(lines) => {
                if lines.len() < printed {
                    debug!("Journal shrank; agent restarted");
                    printed = 0;
                }
                for line in &lines[printed..] {
                    println!("{}", line);
                }
                printed = lines.len();
            }
            Err(err) => warn!("Failed to fetch logs: {}", err),
        }

        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn follow_stops_while_a_fetch_is_pending() {
        // Accepts connections but never answers them.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = ControlClient::new(format!("http://{addr}")).unwrap();
        let finished = timeout(
            Duration::from_secs(5),
            follow_logs(
                &client,
                Duration::from_millis(50),
                sleep(Duration::from_millis(100)),
            ),
        )
        .await;
        assert!(matches!(finished, Ok(Ok(()))));
    }
}
