//! `stepflow`: drive resumable stepwise flows from the command line.
//!
//! Runs live under the configured runs directory (`.stepflow/runs` by
//! default). `start` and `resume` block until the run stops and exit with the
//! code of its status, see [`stepflow::exit_codes`].

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stepflow::exit_codes;
use stepflow::flow::load_flow;
use stepflow::io::config::{DEFAULT_CONFIG_PATH, load_config};
use stepflow::kernel::Kernel;
use stepflow::logging;
use stepflow::runner::RunOutcome;

#[derive(Parser)]
#[command(
    name = "stepflow",
    version,
    about = "Resumable stepwise flow orchestration kernel"
)]
struct Cli {
    /// Kernel configuration file (missing file uses defaults).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override `runs_dir` from the configuration.
    #[arg(long, global = true)]
    runs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a run of a flow and drive it until it stops.
    Start {
        /// Flow definition (TOML).
        flow: PathBuf,
    },
    /// Continue a run from its last checkpoint.
    Resume {
        run_id: String,
        /// Print which steps would be skipped or run, without running anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the status of a run.
    Status {
        run_id: String,
        /// Print the full run record as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Ask a run to stop at its next checkpoint.
    Cancel { run_id: String },
    /// List runs, most recently updated first.
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Check a flow definition without creating a run.
    Validate {
        /// Flow definition (TOML).
        flow: PathBuf,
    },
}

fn main() -> ExitCode {
    logging::init();
    match run() {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(u8::try_from(exit_codes::INVALID).unwrap_or(1))
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let kernel = || -> Result<Kernel> {
        let mut config = load_config(&cli.config)?;
        if let Some(runs_dir) = &cli.runs_dir {
            config.runs_dir.clone_from(runs_dir);
        }
        Ok(Kernel::from_config(config))
    };

    match cli.command {
        Command::Start { flow } => {
            let flow = load_flow(&flow)?;
            let outcome = kernel()?.start_run(&flow)?;
            Ok(report(&outcome))
        }
        Command::Resume {
            run_id,
            dry_run: true,
        } => {
            let plan = kernel()?.resume_plan(&run_id)?;
            println!("{} {}", plan.run_id, plan.status);
            for entry in &plan.entries {
                println!("{:<4} {:<24} {}", entry.action.as_str(), entry.step_id, entry.reason);
            }
            Ok(exit_codes::OK)
        }
        Command::Resume {
            run_id,
            dry_run: false,
        } => {
            let outcome = kernel()?.resume_run(&run_id)?;
            Ok(report(&outcome))
        }
        Command::Status { run_id, json } => {
            let record = kernel()?.run_record(&run_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("{} {}", record.run_id, record.status);
                if let Some(summary) = &record.summary {
                    println!("{}", summary.reason);
                }
            }
            Ok(exit_codes::for_status(record.status))
        }
        Command::Cancel { run_id } => {
            let status = kernel()?.cancel_run(&run_id)?;
            println!("{run_id} {status}");
            Ok(exit_codes::OK)
        }
        Command::List { limit } => {
            for record in kernel()?.list_runs(limit)? {
                println!(
                    "{:<32} {:<12} {:<20} {}",
                    record.run_id,
                    record.status,
                    record.flow_id,
                    record.updated_at.to_rfc3339()
                );
            }
            Ok(exit_codes::OK)
        }
        Command::Validate { flow } => {
            let flow = load_flow(&flow)?;
            println!("flow '{}' is valid ({} steps)", flow.id, flow.steps.len());
            Ok(exit_codes::OK)
        }
    }
}

fn report(outcome: &RunOutcome) -> i32 {
    println!("{} {}", outcome.run_id, outcome.status);
    if let Some(summary) = &outcome.summary {
        println!("{}", summary.reason);
    }
    exit_codes::for_status(outcome.status)
}
