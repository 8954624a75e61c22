//! Operator configuration loaded from environment variables

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::mutator::SidecarImage;

const WATCH_NAMESPACE: &str = "WATCH_NAMESPACE";
const RESYNC_PERIOD_SECS: &str = "RESYNC_PERIOD_SECS";
const MAX_NUM_REQUEUES: &str = "MAX_NUM_REQUEUES";
const WORKERS_PER_KIND: &str = "WORKERS_PER_KIND";
const SIDECAR_IMAGE: &str = "SIDECAR_IMAGE";
const SIDECAR_TAG: &str = "SIDECAR_TAG";
const ENABLE_RBAC: &str = "ENABLE_RBAC";
const RECOVERY_CLUSTER_ROLE: &str = "RECOVERY_CLUSTER_ROLE";
const JOB_POLL_INTERVAL_SECS: &str = "JOB_POLL_INTERVAL_SECS";
const JOB_POLL_TIMEOUT_SECS: &str = "JOB_POLL_TIMEOUT_SECS";
const POD_POLL_INTERVAL_SECS: &str = "POD_POLL_INTERVAL_SECS";
const POD_POLL_TIMEOUT_SECS: &str = "POD_POLL_TIMEOUT_SECS";
const QUEUE_BASE_DELAY_MS: &str = "QUEUE_BASE_DELAY_MS";
const QUEUE_MAX_DELAY_SECS: &str = "QUEUE_MAX_DELAY_SECS";
const METRICS_PORT: &str = "METRICS_PORT";

/// Default image for the backup sidecar and recovery jobs
pub const DEFAULT_SIDECAR_IMAGE: &str = "osodevops/backup-agent";

/// Interval and ceiling for a bounded poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Runtime configuration
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Period of the full cache resync
    pub resync_period: Duration,
    /// Consecutive failures after which a key is dropped
    pub max_num_requeues: u32,
    /// Worker loops per resource kind
    pub workers_per_kind: usize,
    pub sidecar_image: SidecarImage,
    /// Run recovery jobs under their own service account
    pub enable_rbac: bool,
    /// ClusterRole bound to recovery job service accounts
    pub recovery_cluster_role: String,
    pub job_poll: PollSettings,
    pub pod_poll: PollSettings,
    pub queue_base_delay: Duration,
    pub queue_max_delay: Duration,
    pub metrics_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            resync_period: Duration::from_secs(300),
            max_num_requeues: 5,
            workers_per_kind: 1,
            sidecar_image: SidecarImage::new(DEFAULT_SIDECAR_IMAGE, env!("CARGO_PKG_VERSION")),
            enable_rbac: false,
            recovery_cluster_role: "backup-recovery-job".to_string(),
            job_poll: PollSettings {
                interval: Duration::from_secs(180),
                timeout: Duration::from_secs(24 * 60 * 60),
            },
            pod_poll: PollSettings {
                interval: Duration::from_secs(3),
                timeout: Duration::from_secs(600),
            },
            queue_base_delay: Duration::from_millis(5),
            queue_max_delay: Duration::from_secs(1000),
            metrics_port: 8080,
        }
    }
}

impl OperatorConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Load from an explicit variable map; unset variables keep their defaults
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let config = Self {
            watch_namespace: get(WATCH_NAMESPACE).map(str::to_string),
            resync_period: secs(get(RESYNC_PERIOD_SECS), RESYNC_PERIOD_SECS, defaults.resync_period)?,
            max_num_requeues: parse(get(MAX_NUM_REQUEUES), MAX_NUM_REQUEUES, defaults.max_num_requeues)?,
            workers_per_kind: parse(get(WORKERS_PER_KIND), WORKERS_PER_KIND, defaults.workers_per_kind)?,
            sidecar_image: SidecarImage::new(
                get(SIDECAR_IMAGE).unwrap_or(defaults.sidecar_image.repository.as_str()),
                get(SIDECAR_TAG).unwrap_or(defaults.sidecar_image.tag.as_str()),
            ),
            enable_rbac: parse_bool(get(ENABLE_RBAC), ENABLE_RBAC, defaults.enable_rbac)?,
            recovery_cluster_role: get(RECOVERY_CLUSTER_ROLE)
                .map_or(defaults.recovery_cluster_role, str::to_string),
            job_poll: PollSettings {
                interval: secs(get(JOB_POLL_INTERVAL_SECS), JOB_POLL_INTERVAL_SECS, defaults.job_poll.interval)?,
                timeout: secs(get(JOB_POLL_TIMEOUT_SECS), JOB_POLL_TIMEOUT_SECS, defaults.job_poll.timeout)?,
            },
            pod_poll: PollSettings {
                interval: secs(get(POD_POLL_INTERVAL_SECS), POD_POLL_INTERVAL_SECS, defaults.pod_poll.interval)?,
                timeout: secs(get(POD_POLL_TIMEOUT_SECS), POD_POLL_TIMEOUT_SECS, defaults.pod_poll.timeout)?,
            },
            queue_base_delay: get(QUEUE_BASE_DELAY_MS)
                .map(|v| parse_value::<u64>(v, QUEUE_BASE_DELAY_MS).map(Duration::from_millis))
                .transpose()?
                .unwrap_or(defaults.queue_base_delay),
            queue_max_delay: secs(get(QUEUE_MAX_DELAY_SECS), QUEUE_MAX_DELAY_SECS, defaults.queue_max_delay)?,
            metrics_port: parse(get(METRICS_PORT), METRICS_PORT, defaults.metrics_port)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers_per_kind == 0 {
            return Err(Error::config(format!("{} must be at least 1", WORKERS_PER_KIND)));
        }
        if self.resync_period.is_zero() {
            return Err(Error::config(format!("{} must be positive", RESYNC_PERIOD_SECS)));
        }
        for (name, poll) in [("job", self.job_poll), ("pod", self.pod_poll)] {
            if poll.interval.is_zero() || poll.timeout < poll.interval {
                return Err(Error::config(format!(
                    "{} poll interval must be positive and not exceed its timeout",
                    name
                )));
            }
        }
        if self.queue_max_delay < self.queue_base_delay {
            return Err(Error::config(format!(
                "{} must not be below {}",
                QUEUE_MAX_DELAY_SECS, QUEUE_BASE_DELAY_MS
            )));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(raw: &str, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| Error::config(format!("invalid {} '{}': {}", name, raw, e)))
}

fn parse<T: FromStr>(raw: Option<&str>, name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.map_or(Ok(default), |v| parse_value(v, name))
}

fn secs(raw: Option<&str>, name: &str, default: Duration) -> Result<Duration> {
    raw.map_or(Ok(default), |v| parse_value::<u64>(v, name).map(Duration::from_secs))
}

fn parse_bool(raw: Option<&str>, name: &str, default: bool) -> Result<bool> {
    match raw.map(str::to_lowercase).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(Error::config(format!("invalid {} '{}'", name, other))),
    }
}
