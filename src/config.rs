use serde::Deserialize;

/// What happens to a task output once it has been stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRetention {
    /// Keep every output until the results are cleared.
    #[default]
    Retain,
    /// Drop an output as soon as every dependent has read it. Ids returned to
    /// callers stay available until released, after which the executor
    /// forgets them entirely.
    ReleaseConsumed,
}

/// Executor tuning.
///
/// Can be built in code or read from any serde format:
///
/// ```
/// # use pcg_executor::{ExecutorConfig, OutputRetention};
/// let config: ExecutorConfig =
///     serde_json::from_str(r#"{ "worker_threads": 2, "retention": "release_consumed" }"#).unwrap();
/// assert_eq!(config.worker_threads, 2);
/// assert_eq!(config.retention, OutputRetention::ReleaseConsumed);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Size of the worker pool. Zero runs every task on the thread driving
    /// the executor.
    pub worker_threads: usize,
    pub retention: OutputRetention,
    pub thread_name_prefix: String,
    /// Number of task records kept for diagnostics; the oldest go first.
    pub diagnostics_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            retention: OutputRetention::default(),
            thread_name_prefix: String::from("pcg-worker"),
            diagnostics_capacity: 4096,
        }
    }
}

impl ExecutorConfig {
    /// Everything inline, in a deterministic order.
    pub fn inline() -> Self {
        Self::default().with_worker_threads(0)
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_retention(mut self, retention: OutputRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ExecutorConfig = serde_json::from_str(r#"{ "worker_threads": 0 }"#).unwrap();
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.retention, OutputRetention::Retain);
        assert_eq!(config.thread_name_prefix, "pcg-worker");
        assert_eq!(config.diagnostics_capacity, 4096);
    }

    #[test]
    fn test_unknown_retention_is_rejected() {
        let result = serde_json::from_str::<ExecutorConfig>(r#"{ "retention": "forever" }"#);
        assert!(result.is_err());
    }
}
