//! Tandem CLI - offline tools for preference-pair training runs
//!
//! The `tandem` command resolves training plans, inspects collated batches and
//! reads back saved trainer state without starting a training run.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tandem_training::TrainingError;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "tandem",
    author,
    version,
    about = "Tandem - preference-pair training orchestration",
    long_about = "Tandem plans and inspects DPO training runs over packed or padded preference \
                  data.\nNothing here touches model weights."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve the step plan for a run
    ///
    /// Loads the run configuration and the datasets, then prints steps per
    /// epoch, the step budget, and the validation and save cadence.
    Plan {
        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Training dataset (JSONL)
        #[arg(long)]
        train: PathBuf,

        /// Validation dataset (JSONL)
        #[arg(long)]
        val: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Collate the first batches of a dataset
    ///
    /// Runs the sampler and collator for a single worker and reports batch
    /// shapes, packed segment counts and padding.
    Inspect {
        /// Dataset to inspect (JSONL)
        dataset: PathBuf,

        /// Run configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Number of batches to collate
        #[arg(long, default_value = "2")]
        batches: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the newest saved trainer state in a checkpoint directory
    State {
        /// Directory written by the JSON state sink
        dir: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("{} {e}", "warning:".yellow());
    }

    let result = match args.command {
        Command::Plan { config, train, val, json } => {
            commands::plan::execute(&config, &train, val.as_deref(), json)
        }
        Command::Inspect { dataset, config, batches, json } => {
            commands::inspect::execute(&dataset, &config, batches, json)
        }
        Command::State { dir, json } => commands::state::execute(&dir, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            exit_code_for(&e)
        }
    }
}

/// Fleet-level failures (bad configuration, collectives) exit with 2 so a
/// launcher can tell them from a single bad dataset.
fn exit_code_for(error: &anyhow::Error) -> ExitCode {
    let fatal = error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<TrainingError>())
        .any(TrainingError::is_fatal_for_fleet);
    if fatal { ExitCode::from(2) } else { ExitCode::FAILURE }
}
