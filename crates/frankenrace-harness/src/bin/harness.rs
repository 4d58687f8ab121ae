//! CLI entrypoint for the frankenrace trace replayer.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use frankenrace_core::{DetectorConfig, ReportMode};
use frankenrace_harness::replay::JsonLinesSink;
use frankenrace_harness::{HarnessError, Replayer, parse_trace};

/// Replay tooling for the frankenrace detector core.
#[derive(Debug, Parser)]
#[command(name = "frankenrace-harness")]
#[command(about = "Replay JSONL event traces through the frankenrace detector")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a trace, printing one JSON line per race report as it is found.
    Replay {
        /// JSONL trace path.
        trace: PathBuf,
        /// Reporting mode (`report`, `halt`, or `off`); overrides `FRANKENRACE_MODE`.
        #[arg(long)]
        mode: Option<String>,
        /// Append the metrics snapshot after the reports.
        #[arg(long)]
        stats: bool,
        /// Thread identifier space.
        #[arg(long)]
        max_threads: Option<usize>,
        /// Dead threads held back before their tid is reused.
        #[arg(long)]
        quarantine: Option<usize>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    frankenrace_harness::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Replay {
            trace,
            mode,
            stats,
            max_threads,
            quarantine,
        } => {
            let text = std::fs::read_to_string(&trace).map_err(|source| HarnessError::Io {
                path: trace.clone(),
                source,
            })?;
            let events = parse_trace(&text)?;

            let mut config = DetectorConfig::from_env();
            if let Some(mode) = mode {
                config.report_mode = ReportMode::from_str_loose(&mode);
            }
            if let Some(n) = max_threads {
                config.max_threads = n;
            }
            if let Some(n) = quarantine {
                config.thread_quarantine_size = n;
            }

            let outcome = Replayer::with_forward(config, Some(Arc::new(JsonLinesSink)))
                .replay(&events)?;
            if stats {
                let mut out = std::io::stdout().lock();
                writeln!(out, "{}", serde_json::to_string(&outcome.metrics)?)?;
                out.flush()?;
            }
            if outcome.exit_code != 0 {
                std::process::exit(outcome.exit_code);
            }
        }
    }

    Ok(())
}
