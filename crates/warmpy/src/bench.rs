//! Latency summaries for repeated executions.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Aggregate timing of a benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub iterations: usize,
    pub failures: usize,
    pub total_ms: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Executions per second over the whole run.
    pub throughput: f64,
}

impl LatencySummary {
    /// Summarize per-call latencies. `total` is the wall time of the whole
    /// run, which may exceed the sum of samples.
    pub fn from_samples(samples: &[Duration], failures: usize, total: Duration) -> Self {
        let mut ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        ms.sort_by(f64::total_cmp);

        let n = ms.len();
        let total_secs = total.as_secs_f64();
        let (avg, median, min, max, p95, p99) = if n == 0 {
            (0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
        } else {
            (
                ms.iter().sum::<f64>() / n as f64,
                median(&ms),
                ms[0],
                ms[n - 1],
                percentile(&ms, 0.95),
                percentile(&ms, 0.99),
            )
        };

        Self {
            iterations: n,
            failures,
            total_ms: total_secs * 1000.0,
            avg_ms: avg,
            median_ms: median,
            min_ms: min,
            max_ms: max,
            p95_ms: p95,
            p99_ms: p99,
            throughput: if total_secs > 0.0 {
                n as f64 / total_secs
            } else {
                0.0
            },
        }
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Iterations:  {} ({} failed)", self.iterations, self.failures)?;
        writeln!(f, "Total time:  {:.2}ms", self.total_ms)?;
        writeln!(f, "Avg time:    {:.2}ms", self.avg_ms)?;
        writeln!(f, "Median time: {:.2}ms", self.median_ms)?;
        writeln!(f, "Min time:    {:.2}ms", self.min_ms)?;
        writeln!(f, "Max time:    {:.2}ms", self.max_ms)?;
        writeln!(f, "P95 time:    {:.2}ms", self.p95_ms)?;
        writeln!(f, "P99 time:    {:.2}ms", self.p99_ms)?;
        write!(f, "Throughput:  {:.2} calls/sec", self.throughput)
    }
}

/// `sorted` must be non-empty.
fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Nearest-rank percentile on sorted, non-empty samples.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|&v| Duration::from_millis(v)).collect()
    }

    #[test]
    fn test_summary_of_known_samples() {
        let samples = millis(&[5, 1, 4, 2, 3]);
        let summary = LatencySummary::from_samples(&samples, 1, Duration::from_millis(20));

        assert_eq!(summary.iterations, 5);
        assert_eq!(summary.failures, 1);
        assert!((summary.avg_ms - 3.0).abs() < 1e-9);
        assert!((summary.median_ms - 3.0).abs() < 1e-9);
        assert!((summary.min_ms - 1.0).abs() < 1e-9);
        assert!((summary.max_ms - 5.0).abs() < 1e-9);
        assert!((summary.p95_ms - 5.0).abs() < 1e-9);
        assert!((summary.throughput - 250.0).abs() < 1e-6);
    }

    #[test]
    fn test_even_count_median() {
        let samples = millis(&[1, 2, 3, 10]);
        let summary = LatencySummary::from_samples(&samples, 0, Duration::from_millis(16));
        assert!((summary.median_ms - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_percentiles_on_hundred_samples() {
        let samples: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        let summary = LatencySummary::from_samples(&samples, 0, Duration::from_secs(5));
        assert!((summary.p95_ms - 96.0).abs() < 1e-9);
        assert!((summary.p99_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_run() {
        let summary = LatencySummary::from_samples(&[], 0, Duration::ZERO);
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.throughput, 0.0);
        assert!(summary.to_string().contains("Throughput:  0.00"));
    }
}
