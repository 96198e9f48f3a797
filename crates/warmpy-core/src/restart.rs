//! Execution-count driven worker recycling.
//!
//! The reset policy cannot reclaim heap fragmentation, registry growth or
//! leaked descriptors, so the whole worker is replaced after a fixed number of
//! executions. A cheaper garbage-collection pass runs on a shorter cadence.

/// Default number of executions before a worker is replaced.
pub const DEFAULT_MAX_EXECUTIONS: u64 = 1000;

/// Default number of executions between forced garbage collections.
pub const DEFAULT_GC_INTERVAL: u64 = 100;

/// When to recycle a worker and when to collect garbage inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Executions per worker before replacement. Always non-zero.
    pub max_executions: u64,
    /// Executions between garbage-collection passes. `None` disables them.
    pub gc_interval: Option<u64>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_executions: DEFAULT_MAX_EXECUTIONS,
            gc_interval: Some(DEFAULT_GC_INTERVAL),
        }
    }
}

impl RestartPolicy {
    /// Whether the worker must be replaced before the next dispatch.
    pub fn restart_due(&self, counter: &ExecutionCounter) -> bool {
        counter.count() >= self.max_executions
    }

    /// Whether the execution about to be dispatched should be followed by a
    /// garbage-collection pass.
    pub fn gc_due(&self, counter: &ExecutionCounter) -> bool {
        match self.gc_interval {
            Some(interval) if interval > 0 => (counter.count() + 1) % interval == 0,
            _ => false,
        }
    }
}

/// Completed executions since the current worker became ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionCounter {
    count: u64,
}

impl ExecutionCounter {
    /// Executions counted so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Count one completed execution, whatever its outcome.
    pub fn record(&mut self) {
        self.count += 1;
    }

    /// Start over after a restart has completed.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_executions, 1000);
        assert_eq!(policy.gc_interval, Some(100));
    }

    #[test]
    fn test_restart_due_at_budget() {
        let policy = RestartPolicy {
            max_executions: 3,
            gc_interval: None,
        };
        let mut counter = ExecutionCounter::default();
        for _ in 0..3 {
            assert!(!policy.restart_due(&counter));
            counter.record();
        }
        assert!(policy.restart_due(&counter));

        counter.reset();
        assert_eq!(counter.count(), 0);
        assert!(!policy.restart_due(&counter));
    }

    #[test]
    fn test_gc_every_interval() {
        let policy = RestartPolicy {
            max_executions: 1000,
            gc_interval: Some(4),
        };
        let mut counter = ExecutionCounter::default();
        let mut due = Vec::new();
        for _ in 0..12 {
            due.push(policy.gc_due(&counter));
            counter.record();
        }
        // 4th, 8th and 12th executions collect.
        let hits: Vec<usize> = due
            .iter()
            .enumerate()
            .filter(|(_, d)| **d)
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(hits, vec![4, 8, 12]);
    }

    #[test]
    fn test_gc_disabled() {
        let mut policy = RestartPolicy::default();
        policy.gc_interval = None;
        let mut counter = ExecutionCounter::default();
        for _ in 0..250 {
            assert!(!policy.gc_due(&counter));
            counter.record();
        }

        policy.gc_interval = Some(0);
        assert!(!policy.gc_due(&counter));
    }
}
