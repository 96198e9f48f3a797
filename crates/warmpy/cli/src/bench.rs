//! Bench command implementation.

use std::time::{Duration, Instant};

use warmpy::bench::LatencySummary;
use warmpy_core::Executor;

use crate::WorkerArgs;

/// Run `code` `warmup + iterations` times on one executor and print latency
/// statistics for the measured part.
pub async fn execute(
    code: &str,
    iterations: usize,
    warmup: usize,
    json: bool,
    worker: &WorkerArgs,
) -> anyhow::Result<()> {
    let executor = Executor::new(worker.config()?)?;
    executor.start().await?;

    for _ in 0..warmup {
        executor.execute(code).await?;
    }

    let mut samples: Vec<Duration> = Vec::with_capacity(iterations);
    let mut failures = 0;
    let start = Instant::now();
    for i in 0..iterations {
        let call_start = Instant::now();
        let result = executor.execute(code).await?;
        samples.push(call_start.elapsed());
        if let Some(error) = &result.error {
            failures += 1;
            if failures == 1 {
                tracing::warn!(iteration = i, "Fragment failed: {}", error);
            }
        }
    }
    let total = start.elapsed();

    let stats = executor.stats().await;
    executor.shutdown().await;

    let summary = LatencySummary::from_samples(&samples, failures, total);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
        println!("Restarts:    {}", stats.restarts);
    }
    Ok(())
}
