use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use resolution::LedgerEntry;
use resolution_agents::{build_orchestrator, open_ledger, RuntimeConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Contradiction-resolution agents over a shared hash-chained ledger
#[derive(Parser, Debug)]
#[command(name = "resolution-agents")]
#[command(version, about)]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Ledger file (overrides config and RESOLUTION_LEDGER_PATH)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// Unproductive iterations before escalating
    #[arg(long, global = true)]
    max_iterations: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one input to one agent
    Submit {
        #[arg(long, short)]
        agent: String,
        input: String,
    },
    /// Send one input to every agent concurrently
    Broadcast { input: String },
    /// Broadcast, then reconcile the outputs into one decision
    Converge { input: String },
    /// Verify the ledger hash chain
    Verify,
    /// Print ledger entries
    Log {
        /// First sequence number to print
        #[arg(long, default_value_t = 0)]
        from: u64,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List configured agents
    Agents,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
    /// Per-record audit counts
    Summary,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = RuntimeConfig::load(cli.config.as_deref())?;
    if let Some(ledger) = cli.ledger {
        config.ledger_path = ledger;
    }
    if let Some(max) = cli.max_iterations {
        config.cycle.max_iterations = max;
        config.validate()?;
    }

    match cli.command {
        Command::Submit { agent, input } => {
            let orchestrator = build_orchestrator(&config)?;
            let cancel = CancellationToken::new();
            let interrupt = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                })
            };
            let result = orchestrator
                .submit_with_cancel(&agent, &input, &cancel)
                .await;
            interrupt.abort();
            let submission = result?;
            println!("{}", serde_json::to_string_pretty(&submission)?);
        }
        Command::Broadcast { input } => {
            let orchestrator = build_orchestrator(&config)?;
            let mut failed = 0usize;
            for (agent, result) in orchestrator.submit_all(&input).await {
                match result {
                    Ok(submission) => println!("{}", serde_json::to_string(&submission)?),
                    Err(e) => {
                        failed += 1;
                        warn!(agent = %agent, error = %e, "Submission failed");
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} agents failed", failed, orchestrator.agent_count());
            }
        }
        Command::Converge { input } => {
            let orchestrator = build_orchestrator(&config)?;
            let decision = orchestrator.converge(&input).await?;
            for failure in &decision.failures {
                warn!(agent = %failure.agent_id, error = %failure.error, "Submission failed");
            }
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Command::Verify => {
            let ledger = open_ledger(&config)?;
            match ledger.verify_integrity() {
                Ok(()) => {
                    info!(entries = ledger.len(), "Ledger verified");
                    println!("ok: {} entries, head {}", ledger.len(), ledger.head_hash());
                }
                Err(violation) => bail!("{}", violation),
            }
        }
        Command::Log { from, format } => {
            let ledger = open_ledger(&config)?;
            let entries: Vec<_> = ledger.stream_from(from).collect().await;
            for entry in entries {
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string(&*entry)?),
                    OutputFormat::Text => println!("{}", log_line(&entry)),
                    OutputFormat::Summary => {
                        println!("{}", serde_json::to_string(&entry.payload().summary())?)
                    }
                }
            }
        }
        Command::Agents => {
            for agent in &config.agents {
                println!("{:<10} {}", agent.id, agent.constraints.join(", "));
            }
        }
    }

    Ok(())
}

fn log_line(entry: &LedgerEntry) -> String {
    let record = entry.payload();
    let status = match (&record.output_effect, record.escalated) {
        (None, _) => "failed",
        (Some(_), true) => "escalated",
        (Some(_), false) => "committed",
    };
    format!(
        "{:>6}  {}  {:<10} {:<9} resolved={} unresolved={} gaps={}  {}",
        entry.sequence_number(),
        entry.hash().get(..12).unwrap_or(entry.hash()),
        record.agent_id,
        status,
        record.resolved_count(),
        record.unresolved().len(),
        record.gaps.len(),
        entry.timestamp().to_rfc3339(),
    )
}
