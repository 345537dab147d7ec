use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mailqueue_agent::config::{AgentConfig, DEFAULT_CONFIG_PATH};
use mailqueue_agent::engine::Agent;
use mailqueue_agent::transport::{ImapTransport, Transport};

/// Mailbox agent: claims messages from an IMAP inbox and acknowledges them.
#[derive(Parser, Debug)]
#[command(name = "mailqueue-agent", version, about)]
struct Cli {
    /// Agent email address
    #[arg(short, long, env = "AGENT_EMAIL")]
    email: Option<String>,

    /// Seconds between poll cycles
    #[arg(short, long)]
    interval: Option<u64>,

    /// Stop after this many poll cycles
    #[arg(short = 'n', long)]
    iterations: Option<u64>,

    /// Recipient of an initial message (requires --message)
    #[arg(short, long)]
    target: Option<String>,

    /// Initial message payload as JSON (requires --target)
    #[arg(short, long)]
    message: Option<String>,

    /// Path to the JSON config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let initial = match (cli.target, cli.message) {
        (Some(target), Some(raw)) => {
            serde_json::from_str::<serde_json::Value>(&raw)
                .context("--message is not valid JSON")?;
            Some((target, raw))
        }
        (None, None) => None,
        (Some(_), None) => bail!("--target requires --message"),
        (None, Some(_)) => bail!("--message requires --target"),
    };

    let mut config = AgentConfig::load(&cli.config)?;
    if let Some(email) = cli.email {
        config.agent_email = email;
    }
    if let Some(secs) = cli.interval {
        config.check_interval = Duration::from_secs(secs);
    }

    let agent_email = config.require_agent_email()?.to_string();
    let imap = config.require_imap()?;
    let smtp = config.require_smtp()?;

    eprintln!("📬 Mailqueue agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {agent_email}");
    eprintln!("   IMAP: {}:{} ({})", imap.host, imap.port, imap.mailbox);
    eprintln!("   SMTP: {}:{}", smtp.host, smtp.port);
    eprintln!("   Poll every {}s, up to {} per cycle\n", config.check_interval.as_secs(), config.max_messages);

    let transport: Arc<dyn Transport> =
        Arc::new(ImapTransport::new(agent_email.as_str(), imap, &smtp)?);
    let agent = Agent::with_default_handler(config, transport);
    agent
        .prepare()
        .await
        .context("mailbox is not usable")?;

    if let Some((target, raw)) = initial {
        let sent = agent
            .initiate(&target, &raw)
            .await
            .context("failed to send initial message")?;
        info!(message_id = %sent.message_id, recipient = %target, "Initial message sent");
    }

    let summary = agent.run(cli.iterations).await;
    if summary.interrupted {
        eprintln!("\nInterrupted after {} cycle(s)", summary.iterations);
    }
    info!(processed = summary.processed, "Shutting down");
    Ok(())
}
