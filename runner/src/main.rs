use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tessera_runner::{
    config::{ConfigErrors, RunnerConfig},
    engine::SubmissionEngine,
    executors::{Executor, Executors},
    logging, worker,
};
use tracing::{error, info, Level};
use tracing_unwrap::ResultExt;

#[derive(Parser)]
#[command(name = "tessera-runner")]
#[command(about = "Run workflow task chains locally or on a SLURM cluster")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow described by a configuration file
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Execute a single serialized unit, used inside cluster jobs
    Worker {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        input_file: PathBuf,
        #[arg(long)]
        output_file: PathBuf,
    },
}

fn main() -> ExitCode {
    logging::init(Level::INFO);

    match Cli::parse().command {
        Commands::Run { config } => run(config),
        Commands::Worker {
            kind,
            input_file,
            output_file,
        } => match worker::dispatch(&kind, &input_file, &output_file) {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(error = ?error, "Worker failed");
                ExitCode::FAILURE
            }
        },
    }
}

fn run(path: PathBuf) -> ExitCode {
    let mut config = match RunnerConfig::load(&path) {
        Ok(config) => config,
        Err(error) => {
            error!(error = ?error, "Failed to load {}", path.display());
            return ExitCode::FAILURE;
        }
    };

    if config.preflight_checks() {
        error!("{}", ConfigErrors::Invalid);
        return ExitCode::FAILURE;
    }

    let workflow_dir = config.workflow_dir.clone();
    let workflow_dir_user = config.workflow_dir_user().to_path_buf();

    let executor = Arc::new(
        Executors::load(&config.executor, &workflow_dir, &workflow_dir_user).unwrap_or_log(),
    );
    let engine =
        SubmissionEngine::new(Arc::clone(&executor), &workflow_dir, &workflow_dir_user)
            .unwrap_or_log();

    let result = engine.run(config.tasks, config.initial_state);
    executor.shutdown();

    match result {
        Ok(state) => {
            info!("Workflow finished");
            println!("{}", serde_json::to_string_pretty(&state).unwrap_or_log());
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!("Workflow failed: {error}");
            ExitCode::FAILURE
        }
    }
}
