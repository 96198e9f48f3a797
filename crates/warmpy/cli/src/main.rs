//! warmpy CLI - run Python fragments on a warm worker process.

mod bench;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use warmpy_core::ExecutorConfig;

#[derive(Parser)]
#[command(name = "warmpy")]
#[command(about = "Run Python fragments on a warm, recycled worker process")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one fragment and print the result as JSON
    Run {
        /// Fragment source; read from --file or stdin when omitted
        code: Option<String>,

        /// Read the fragment from a file
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,

        /// Text presented to the fragment as standard input
        #[arg(long)]
        input: Option<String>,

        /// Timeout in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<f64>,

        /// Evict modules imported by the fragment afterwards
        #[arg(long)]
        cleanup_modules: bool,

        #[command(flatten)]
        worker: WorkerArgs,
    },

    /// Run a fragment repeatedly and report latency statistics
    Bench {
        /// Fragment source
        #[arg(default_value = "x = sum(range(100))")]
        code: String,

        /// Number of measured executions
        #[arg(short = 'n', long, default_value = "100")]
        iterations: usize,

        /// Executions before measuring starts
        #[arg(long, default_value = "5")]
        warmup: usize,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        worker: WorkerArgs,
    },
}

/// Worker options shared by all subcommands.
#[derive(Args)]
struct WorkerArgs {
    /// Path to the warmpy-worker binary [default: $WARMPY_WORKER_PATH,
    /// then next to this executable, then PATH]
    #[arg(long, value_name = "PATH")]
    worker: Option<PathBuf>,

    /// Directory to append to the worker's sys.path (repeatable)
    #[arg(long = "search-path", value_name = "DIR")]
    search_paths: Vec<PathBuf>,

    /// Executions before the worker is recycled
    #[arg(long, value_name = "N")]
    max_executions: Option<u64>,
}

impl WorkerArgs {
    /// Environment-derived config with these flags layered on top.
    fn config(&self) -> warmpy_core::Result<ExecutorConfig> {
        let mut config = ExecutorConfig::from_env()?;
        if let Some(worker) = &self.worker {
            config.worker.program = Some(worker.clone());
        }
        config
            .worker
            .search_paths
            .extend(self.search_paths.iter().cloned());
        if let Some(max) = self.max_executions {
            config = config.with_max_executions(max);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format warmpy-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<warmpy_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    let code = match cli.command {
        Commands::Run {
            code,
            file,
            input,
            timeout,
            cleanup_modules,
            worker,
        } => {
            let options = run::RunOptions {
                code,
                file,
                input,
                timeout,
                cleanup_modules,
            };
            run::execute(options, &worker).await.map_err(format_error)?
        }

        Commands::Bench {
            code,
            iterations,
            warmup,
            json,
            worker,
        } => {
            bench::execute(&code, iterations, warmup, json, &worker)
                .await
                .map_err(format_error)?;
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
