//! Download run configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a download run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound on parallel peer sessions. The effective worker count is
    /// `min(max_workers, number of peers)`.
    pub max_workers: usize,

    /// In-worker retry attempts for a single piece before it is reported
    /// as failed.
    pub max_retries: usize,

    /// Total download deadline for the whole run.
    pub timeout: Duration,

    /// Emit chattier per-worker diagnostics.
    pub verbose: bool,

    /// Maximum outstanding block requests per peer session.
    pub pipeline_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 50,
            max_retries: 3,
            timeout: Duration::from_secs(5 * 60),
            verbose: false,
            pipeline_depth: 5,
        }
    }
}

impl Config {
    /// Set the worker cap. Zero is ignored and keeps the current value.
    pub fn with_max_workers(mut self, n: usize) -> Self {
        if n > 0 {
            self.max_workers = n;
        }
        self
    }

    /// Set the per-piece retry count. Zero is ignored.
    pub fn with_max_retries(mut self, n: usize) -> Self {
        if n > 0 {
            self.max_retries = n;
        }
        self
    }

    /// Set the run deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the block request pipeline depth. Zero is ignored.
    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        if depth > 0 {
            self.pipeline_depth = depth;
        }
        self
    }
}
