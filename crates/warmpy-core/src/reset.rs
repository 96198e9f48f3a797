//! Snapshot and rollback of process-global state around one execution.
//!
//! A fragment's local bindings die with its scope, but process-wide
//! singletons survive it. Only two of them are tracked, both treated as
//! append-only stacks:
//!
//! - the module search path (`sys.path`), always;
//! - the module registry (`sys.modules`), only when deep cleanup is enabled,
//!   since evicting cached modules forces them to re-initialize on next import.
//!
//! Everything else (environment variables, working directory, import hooks)
//! is left alone and bounded by the restart policy instead.

use rustc_hash::FxHashSet;

use crate::error::Result;

/// Access to the process-global collections the reset policy tracks.
pub trait GlobalState {
    /// Current length of the module search path.
    fn search_path_len(&mut self) -> Result<usize>;

    /// Remove and return the most recently appended search-path entry.
    fn pop_search_path(&mut self) -> Result<Option<String>>;

    /// Names currently present in the module registry.
    fn module_names(&mut self) -> Result<Vec<String>>;

    /// Remove a module from the registry. Returns `false` if it was absent.
    fn evict_module(&mut self, name: &str) -> Result<bool>;
}

/// Global state recorded immediately before one execution.
#[derive(Debug, Clone)]
pub struct GlobalStateSnapshot {
    path_len: usize,
    modules: Option<FxHashSet<String>>,
}

/// What a rollback removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Search-path entries popped.
    pub path_entries_removed: usize,
    /// Module-registry entries evicted.
    pub modules_evicted: usize,
    /// Registry entries that refused eviction.
    pub eviction_failures: usize,
}

impl GlobalStateSnapshot {
    /// Record the current global state. With `deep`, also record the module
    /// registry names.
    pub fn capture<G: GlobalState + ?Sized>(state: &mut G, deep: bool) -> Result<Self> {
        let path_len = state.search_path_len()?;
        let modules = if deep {
            Some(state.module_names()?.into_iter().collect())
        } else {
            None
        };
        Ok(Self { path_len, modules })
    }

    /// Search-path length at capture time.
    pub fn path_len(&self) -> usize {
        self.path_len
    }

    /// Whether the module registry was recorded.
    pub fn is_deep(&self) -> bool {
        self.modules.is_some()
    }

    /// Roll global state back to this snapshot.
    ///
    /// Pops search-path entries newest first until the recorded length is
    /// reached; a path that shrank below it is left as is. Registry entries
    /// not present at capture time are evicted, except private (`_`-prefixed)
    /// ones. Failures are logged and never abort the rollback.
    pub fn rollback<G: GlobalState + ?Sized>(self, state: &mut G) -> RollbackReport {
        let mut report = RollbackReport::default();

        loop {
            match state.search_path_len() {
                Ok(len) if len > self.path_len => {}
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!("Failed to read search path length: {}", e);
                    break;
                }
            }
            match state.pop_search_path() {
                Ok(Some(entry)) => {
                    tracing::trace!(entry = %entry, "Removed search path entry");
                    report.path_entries_removed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to pop search path entry: {}", e);
                    break;
                }
            }
        }

        if let Some(baseline) = self.modules {
            let current = match state.module_names() {
                Ok(names) => names,
                Err(e) => {
                    tracing::warn!("Failed to list module registry: {}", e);
                    Vec::new()
                }
            };
            for name in current {
                if baseline.contains(&name) || name.starts_with('_') {
                    continue;
                }
                match state.evict_module(&name) {
                    Ok(true) => report.modules_evicted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::debug!(module = %name, "Module refused eviction: {}", e);
                        report.eviction_failures += 1;
                    }
                }
            }
        }

        report
    }
}

/// Run `f` between a snapshot and a rollback of `state`.
///
/// The rollback runs whenever `f` returns, so callers that need panic safety
/// must catch unwinding inside `f`. If the snapshot itself cannot be taken,
/// `f` still runs and no rollback is attempted.
pub fn run_with_reset<G, T>(
    state: &mut G,
    deep: bool,
    f: impl FnOnce(&mut G) -> T,
) -> (T, Option<RollbackReport>)
where
    G: GlobalState + ?Sized,
{
    let snapshot = match GlobalStateSnapshot::capture(state, deep) {
        Ok(snapshot) => {
            tracing::trace!(
                path_len = snapshot.path_len(),
                deep = snapshot.is_deep(),
                "Captured global state"
            );
            Some(snapshot)
        }
        Err(e) => {
            tracing::warn!("Failed to snapshot global state, skipping reset: {}", e);
            None
        }
    };

    let output = f(state);
    let report = snapshot.map(|snapshot| snapshot.rollback(state));
    (output, report)
}
