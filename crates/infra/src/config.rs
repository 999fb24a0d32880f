//! Configuration loading and representation.
//!
//! Every value has a default and can be overridden through a `FISCALQ_`-prefixed
//! environment variable. Durations are given in whole seconds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use fiscalq_queue::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Queue manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Used when an admission spec does not set `max_attempts`.
    pub default_max_attempts: u32,
    pub max_attempts_ceiling: u32,
    /// A job `processing` for longer than this is considered abandoned.
    pub stall_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(30 * 60),
            default_max_attempts: 3,
            max_attempts_ceiling: 20,
            stall_timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base, self.backoff_cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Sleep between claim attempts while the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound for one consultation.
    pub consultation_timeout: Duration,
    /// Pause after each processed job, easing the portal's login rate limit.
    pub inter_job_pause: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            consultation_timeout: Duration::from_secs(10 * 60),
            inter_job_pause: Duration::from_secs(2),
            name: "consultation-worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://fiscalq.db".to_string(),
        }
    }
}

/// External browser-automation program invoked once per consultation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("fiscalq-portal-bot"),
            args: Vec::new(),
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiscalqConfig {
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub automation: AutomationConfig,
    /// `json` or `pretty`; interpreted by the observability crate.
    pub log_format: String,
}

impl Default for FiscalqConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            storage: StorageConfig::default(),
            automation: AutomationConfig::default(),
            log_format: "json".to_string(),
        }
    }
}

impl FiscalqConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a fixed map (tests, embedded setups).
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(&lookup);

        let queue = QueueConfig {
            backoff_base: env.secs("FISCALQ_BACKOFF_BASE_SECS", defaults.queue.backoff_base)?,
            backoff_cap: env.secs("FISCALQ_BACKOFF_CAP_SECS", defaults.queue.backoff_cap)?,
            default_max_attempts: env.parse(
                "FISCALQ_DEFAULT_MAX_ATTEMPTS",
                defaults.queue.default_max_attempts,
            )?,
            max_attempts_ceiling: env.parse(
                "FISCALQ_MAX_ATTEMPTS_CEILING",
                defaults.queue.max_attempts_ceiling,
            )?,
            stall_timeout: env.secs("FISCALQ_STALL_TIMEOUT_SECS", defaults.queue.stall_timeout)?,
        };

        if queue.default_max_attempts == 0 {
            return Err(env.invalid("FISCALQ_DEFAULT_MAX_ATTEMPTS"));
        }
        if queue.max_attempts_ceiling < queue.default_max_attempts {
            return Err(env.invalid("FISCALQ_MAX_ATTEMPTS_CEILING"));
        }

        let scheduler = SchedulerConfig {
            tick_interval: env.nonzero_secs(
                "FISCALQ_SCHEDULER_TICK_SECS",
                defaults.scheduler.tick_interval,
            )?,
        };

        let worker = WorkerConfig {
            poll_interval: env.nonzero_secs("FISCALQ_WORKER_POLL_SECS", defaults.worker.poll_interval)?,
            consultation_timeout: env.nonzero_secs(
                "FISCALQ_CONSULTATION_TIMEOUT_SECS",
                defaults.worker.consultation_timeout,
            )?,
            inter_job_pause: env.secs("FISCALQ_INTER_JOB_PAUSE_SECS", defaults.worker.inter_job_pause)?,
            name: lookup("FISCALQ_WORKER_NAME").unwrap_or(defaults.worker.name),
        };

        // a claim younger than the consultation timeout may still be running
        if queue.stall_timeout <= worker.consultation_timeout {
            return Err(env.invalid("FISCALQ_STALL_TIMEOUT_SECS"));
        }

        let storage = StorageConfig {
            database_url: lookup("FISCALQ_DATABASE_URL").unwrap_or(defaults.storage.database_url),
        };

        let automation = AutomationConfig {
            program: lookup("FISCALQ_RUNNER_PROGRAM")
                .map(PathBuf::from)
                .unwrap_or(defaults.automation.program),
            args: lookup("FISCALQ_RUNNER_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        };

        let log_format = lookup("FISCALQ_LOG_FORMAT").unwrap_or(defaults.log_format);

        Ok(Self {
            queue,
            scheduler,
            worker,
            storage,
            automation,
            log_format,
        })
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn invalid(&self, key: &str) -> ConfigError {
        ConfigError::Invalid {
            key: key.to_string(),
            value: (self.0)(key).unwrap_or_default(),
        }
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn nonzero_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let value = self.secs(key, default)?;
        if value.is_zero() {
            return Err(self.invalid(key));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = FiscalqConfig::from_map(&HashMap::new()).unwrap();
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.worker.poll_interval, Duration::from_secs(5));
        assert_eq!(config.worker.inter_job_pause, Duration::from_secs(2));
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(60));
        assert_eq!(config.log_format, "json");
    }

    #[test]
    fn overrides_are_applied() {
        let config = FiscalqConfig::from_map(&vars(&[
            ("FISCALQ_BACKOFF_BASE_SECS", "30"),
            ("FISCALQ_DEFAULT_MAX_ATTEMPTS", "5"),
            ("FISCALQ_DATABASE_URL", "sqlite::memory:"),
            ("FISCALQ_RUNNER_ARGS", "--headless  --state SP"),
        ]))
        .unwrap();

        assert_eq!(config.queue.backoff_base, Duration::from_secs(30));
        assert_eq!(config.queue.default_max_attempts, 5);
        assert_eq!(config.storage.database_url, "sqlite::memory:");
        assert_eq!(config.automation.args, vec!["--headless", "--state", "SP"]);
        assert_eq!(config.queue.retry_policy().base_delay, Duration::from_secs(30));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = FiscalqConfig::from_map(&vars(&[("FISCALQ_WORKER_POLL_SECS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "FISCALQ_WORKER_POLL_SECS".to_string(),
                value: "soon".to_string(),
            }
        );

        assert!(FiscalqConfig::from_map(&vars(&[("FISCALQ_SCHEDULER_TICK_SECS", "0")])).is_err());
        assert!(FiscalqConfig::from_map(&vars(&[("FISCALQ_DEFAULT_MAX_ATTEMPTS", "0")])).is_err());
        assert!(
            FiscalqConfig::from_map(&vars(&[
                ("FISCALQ_DEFAULT_MAX_ATTEMPTS", "10"),
                ("FISCALQ_MAX_ATTEMPTS_CEILING", "4"),
            ]))
            .is_err()
        );
    }

    #[test]
    fn stall_timeout_must_exceed_consultation_timeout() {
        let err = FiscalqConfig::from_map(&vars(&[("FISCALQ_STALL_TIMEOUT_SECS", "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "FISCALQ_STALL_TIMEOUT_SECS".to_string(),
                value: "0".to_string(),
            }
        );

        assert!(
            FiscalqConfig::from_map(&vars(&[
                ("FISCALQ_STALL_TIMEOUT_SECS", "600"),
                ("FISCALQ_CONSULTATION_TIMEOUT_SECS", "600"),
            ]))
            .is_err()
        );

        let config = FiscalqConfig::from_map(&vars(&[
            ("FISCALQ_STALL_TIMEOUT_SECS", "601"),
            ("FISCALQ_CONSULTATION_TIMEOUT_SECS", "600"),
        ]))
        .unwrap();
        assert!(config.queue.stall_timeout > config.worker.consultation_timeout);
    }
}
