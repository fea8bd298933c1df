//! Worker pool configuration

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes
    #[serde(default = "crate::domains::utils::default_pool_size")]
    pub size: usize,

    /// How to start a worker process
    pub worker: WorkerCommand,

    /// Upper bound on starting one worker, handshake included
    #[serde(with = "humantime_serde")]
    pub init_timeout: Duration,

    /// Time allowed for the first `ping` to be answered
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Time allowed for a periodic health probe
    #[serde(with = "humantime_serde")]
    pub health_probe_timeout: Duration,

    /// Interval between health sweeps; disabled when absent
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub health_check_interval: Option<Duration>,

    /// Maximum number of callers waiting for a worker
    pub queue_depth: usize,

    /// Default per-call deadline covering queue wait and response
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long a worker may stay silent after its caller gave up before it
    /// is recycled
    #[serde(with = "humantime_serde")]
    pub abandoned_call_grace: Duration,

    /// Time in-flight calls get to finish during shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Replace workers that exit unexpectedly
    #[serde(default = "crate::domains::utils::default_true")]
    pub restart_on_crash: bool,

    /// Replacements allowed per worker slot
    pub max_restart_attempts: u32,

    /// Base delay before a replacement is started; doubles per restart of
    /// the same slot
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,
}

/// External worker program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    pub program: String,

    pub args: Vec<String>,

    pub env: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Append `--worker-id <id>` to the arguments
    #[serde(default = "crate::domains::utils::default_true")]
    pub pass_worker_id: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: crate::domains::utils::default_pool_size(),
            worker: WorkerCommand::default(),
            init_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            health_probe_timeout: Duration::from_secs(5),
            health_check_interval: Some(Duration::from_secs(30)),
            queue_depth: 100,
            request_timeout: Duration::from_secs(60),
            abandoned_call_grace: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            restart_on_crash: true,
            max_restart_attempts: 5,
            restart_delay: Duration::from_millis(500),
        }
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "pitboss-echo-worker".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            pass_worker_id: true,
        }
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.size, "size", self.domain_name())?;
        validate_duration(self.init_timeout, "init_timeout", self.domain_name())?;
        validate_duration(self.handshake_timeout, "handshake_timeout", self.domain_name())?;
        validate_duration(
            self.health_probe_timeout,
            "health_probe_timeout",
            self.domain_name(),
        )?;
        validate_duration(self.request_timeout, "request_timeout", self.domain_name())?;

        if self.handshake_timeout > self.init_timeout {
            return Err(self.validation_error(format!(
                "handshake_timeout ({:?}) cannot exceed init_timeout ({:?})",
                self.handshake_timeout, self.init_timeout
            )));
        }

        if let Some(interval) = self.health_check_interval {
            validate_duration(interval, "health_check_interval", self.domain_name())?;
        }

        if self.queue_depth == 0 {
            log::warn!("pool.queue_depth is 0: calls fail with queue_full whenever every worker is busy");
        }

        self.worker.validate()
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

impl Validatable for WorkerCommand {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.program, "program", self.domain_name())?;

        if let Some(dir) = &self.working_dir {
            if dir.as_os_str().is_empty() {
                return Err(self.validation_error("working_dir cannot be empty when set"));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool.worker"
    }
}
