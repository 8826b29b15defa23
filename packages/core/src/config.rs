//! Operational configuration for the orchestrator.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables shared by the commander, the worker pool and the backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of worker units in the pool.
    pub workers: u32,
    /// Capacity of the in-process channel queue.
    pub queue_capacity: usize,
    /// Attempts per work item before it fails terminally.
    pub max_attempts: u32,
    /// Bound on a single engine invocation (seconds).
    pub engine_timeout_secs: u64,
    /// Age after which an unreleased claim is reverted (seconds).
    pub claim_timeout_secs: u64,
    /// Broker lease length before an unacknowledged message is redelivered (seconds).
    pub visibility_timeout_secs: u64,
    /// Interval of the supervisor's claim sweep (seconds).
    pub sweep_interval_secs: u64,
    /// Broker polling interval while the queue is empty (milliseconds).
    pub poll_interval_ms: u64,
    /// Retries of a backend call that failed with a transport error.
    pub transport_retries: u32,
    /// Initial backoff between those retries (milliseconds), doubled each time.
    pub retry_backoff_ms: u64,
    /// First job identifier handed out by a fresh state store.
    pub starting_job_id: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            max_attempts: 3,
            engine_timeout_secs: 300, // 5 minutes default
            claim_timeout_secs: 900,
            visibility_timeout_secs: 900,
            sweep_interval_secs: 30,
            poll_interval_ms: 250,
            transport_retries: 3,
            retry_backoff_ms: 200,
            starting_job_id: 1,
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from `DISPATCH_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let cfg = Self {
            workers: env_or("DISPATCH_WORKERS", defaults.workers)?,
            queue_capacity: env_or("DISPATCH_QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_attempts: env_or("DISPATCH_MAX_ATTEMPTS", defaults.max_attempts)?,
            engine_timeout_secs: env_or(
                "DISPATCH_ENGINE_TIMEOUT_SECS",
                defaults.engine_timeout_secs,
            )?,
            claim_timeout_secs: env_or("DISPATCH_CLAIM_TIMEOUT_SECS", defaults.claim_timeout_secs)?,
            visibility_timeout_secs: env_or(
                "DISPATCH_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout_secs,
            )?,
            sweep_interval_secs: env_or(
                "DISPATCH_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
            poll_interval_ms: env_or("DISPATCH_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            transport_retries: env_or("DISPATCH_TRANSPORT_RETRIES", defaults.transport_retries)?,
            retry_backoff_ms: env_or("DISPATCH_RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
            starting_job_id: env_or("DISPATCH_STARTING_JOB_ID", defaults.starting_job_id)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Constraint("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Constraint(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Constraint(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.sweep_interval_secs == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Constraint(
                "sweep_interval_secs and poll_interval_ms must be positive".into(),
            ));
        }
        if self.claim_timeout_secs <= self.engine_timeout_secs {
            return Err(ConfigError::Constraint(format!(
                "claim_timeout_secs ({}) must exceed engine_timeout_secs ({})",
                self.claim_timeout_secs, self.engine_timeout_secs
            )));
        }
        if self.visibility_timeout_secs <= self.engine_timeout_secs {
            return Err(ConfigError::Constraint(format!(
                "visibility_timeout_secs ({}) must exceed engine_timeout_secs ({})",
                self.visibility_timeout_secs, self.engine_timeout_secs
            )));
        }
        Ok(())
    }

    /// Set the number of worker units.
    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    /// Set the channel queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the retry budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the engine timeout.
    pub fn with_engine_timeout(mut self, timeout_secs: u64) -> Self {
        self.engine_timeout_secs = timeout_secs;
        self
    }

    /// Set the claim timeout.
    pub fn with_claim_timeout(mut self, timeout_secs: u64) -> Self {
        self.claim_timeout_secs = timeout_secs;
        self
    }

    /// Set the broker visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout_secs: u64) -> Self {
        self.visibility_timeout_secs = timeout_secs;
        self
    }

    /// Set the broker polling interval.
    pub fn with_poll_interval(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval_secs: u64) -> Self {
        self.sweep_interval_secs = interval_secs;
        self
    }

    /// Set transport retry count and initial backoff.
    pub fn with_transport_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.transport_retries = retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Set the first job identifier.
    pub fn with_starting_job_id(mut self, id: u64) -> Self {
        self.starting_job_id = id;
        self
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: raw,
                })
        }
        _ => Ok(default),
    }
}
