//! warmpy worker process.
//!
//! Embeds a Python interpreter and serves fragment requests over
//! stdin/stdout until stdin is closed. Spawned by the warmpy executor;
//! not meant to be run by hand except for debugging.

mod engine;

use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use warmpy_core::run_worker_loop;

use engine::PythonEngine;

#[derive(Parser)]
#[command(name = "warmpy-worker")]
#[command(about = "Persistent Python fragment worker for warmpy")]
#[command(version)]
struct Args {
    /// Directory to append to sys.path before accepting requests (repeatable)
    #[arg(long = "search-path", value_name = "DIR")]
    search_paths: Vec<PathBuf>,

    /// Enable verbose logging (to stderr)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    // Must happen before the interpreter starts and before anything logs.
    let channel = match protocol_channel() {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("warmpy-worker: failed to set up protocol channel: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let args = Args::parse();

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match run(&args, channel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Worker error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args, channel: impl io::Write) -> anyhow::Result<()> {
    let mut engine = PythonEngine::new()?;
    for dir in &args.search_paths {
        engine.append_search_path(dir)?;
    }
    tracing::debug!(
        pid = std::process::id(),
        python = %engine.version(),
        "Worker initialized"
    );

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut writer = BufWriter::new(channel);
    let stats = run_worker_loop(&mut engine, &mut reader, &mut writer)?;

    tracing::debug!(
        requests = stats.requests,
        failures = stats.failures,
        "Worker finished"
    );
    Ok(())
}

/// Take exclusive ownership of the original stdout for protocol records and
/// point descriptor 1 at stderr, so stray native writes cannot corrupt the
/// channel.
#[cfg(unix)]
fn protocol_channel() -> io::Result<std::fs::File> {
    use std::os::fd::FromRawFd;

    // SAFETY: dup/dup2 on the process's own standard descriptors.
    let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    // SAFETY: `fd` is a freshly duplicated descriptor owned by nothing else.
    Ok(unsafe { std::fs::File::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn protocol_channel() -> io::Result<io::Stdout> {
    Ok(io::stdout())
}
