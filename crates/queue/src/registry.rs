//! Queue registry.
//!
//! The static table of named queues, loaded once at startup from the queue
//! manifest (`queue.yaml`) and read-only afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Dispatch rate such as `300/s` or `10/m`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate {
    count: f64,
    unit: RateUnit,
}

/// Time unit of a [`Rate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    /// `/s`
    Second,
    /// `/m`
    Minute,
    /// `/h`
    Hour,
    /// `/d`
    Day,
}

impl RateUnit {
    const fn seconds(self) -> f64 {
        match self {
            Self::Second => 1.0,
            Self::Minute => 60.0,
            Self::Hour => 3600.0,
            Self::Day => 86400.0,
        }
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::Second => "s",
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
        }
    }
}

impl Rate {
    /// Tasks per second.
    #[must_use]
    pub fn per_second(&self) -> f64 {
        self.count / self.unit.seconds()
    }

    /// Shorthand for `n/s`.
    pub fn per_sec(count: f64) -> QueueResult<Self> {
        Self::new(count, RateUnit::Second)
    }

    /// Build a rate, rejecting non-positive counts.
    pub fn new(count: f64, unit: RateUnit) -> QueueResult<Self> {
        if !count.is_finite() || count <= 0.0 {
            return Err(QueueError::Config(format!("rate must be positive, got {count}")));
        }
        Ok(Self { count, unit })
    }
}

impl FromStr for Rate {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| QueueError::Config(format!("rate {s:?} is not of the form N/unit")))?;

        let count: f64 = count
            .trim()
            .parse()
            .map_err(|_| QueueError::Config(format!("rate {s:?} has an invalid count")))?;

        let unit = match unit.trim() {
            "s" => RateUnit::Second,
            "m" => RateUnit::Minute,
            "h" => RateUnit::Hour,
            "d" => RateUnit::Day,
            other => {
                return Err(QueueError::Config(format!("rate {s:?} has unknown unit {other:?}")));
            }
        };

        Self::new(count, unit)
    }
}

impl TryFrom<String> for Rate {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rate> for String {
    fn from(rate: Rate) -> Self {
        rate.to_string()
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, self.unit.suffix())
    }
}

/// Retry policy of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryParameters {
    /// Retries allowed after the initial attempt.
    #[serde(default = "default_task_retry_limit")]
    pub task_retry_limit: u32,
    /// Delay before the first retry.
    #[serde(default = "default_min_backoff_seconds")]
    pub min_backoff_seconds: f64,
    /// Times the delay doubles before it stops growing.
    #[serde(default = "default_max_doublings")]
    pub max_doublings: u32,
    /// Optional hard cap on the delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_seconds: Option<f64>,
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            task_retry_limit: default_task_retry_limit(),
            min_backoff_seconds: default_min_backoff_seconds(),
            max_doublings: default_max_doublings(),
            max_backoff_seconds: None,
        }
    }
}

const fn default_task_retry_limit() -> u32 {
    5
}

const fn default_min_backoff_seconds() -> f64 {
    0.1
}

const fn default_max_doublings() -> u32 {
    16
}

fn default_target() -> String {
    "default".to_string()
}

const fn default_max_concurrent_requests() -> u32 {
    1000
}

/// One named queue. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDefinition {
    /// Unique queue name.
    pub name: String,
    /// Logical handler group the queue's tasks are delivered to.
    #[serde(default = "default_target")]
    pub target: String,
    /// Dispatch rate.
    pub rate: Rate,
    /// Token bucket capacity; defaults to one second's worth of tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<u32>,
    /// In-flight cap.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,
    /// Retry policy.
    #[serde(default)]
    pub retry_parameters: RetryParameters,
    /// Per-queue override of the handler timeout, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_timeout_seconds: Option<u64>,
}

impl QueueDefinition {
    /// Definition with default retry policy and concurrency.
    pub fn new(name: impl Into<String>, target: impl Into<String>, rate: Rate) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            rate,
            bucket_size: None,
            max_concurrent_requests: default_max_concurrent_requests(),
            retry_parameters: RetryParameters::default(),
            handler_timeout_seconds: None,
        }
    }

    /// Set the in-flight cap.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryParameters) -> Self {
        self.retry_parameters = retry;
        self
    }

    /// Token bucket capacity actually used.
    #[must_use]
    pub fn burst(&self) -> f64 {
        self.bucket_size
            .map_or_else(|| self.rate.per_second().ceil().max(1.0), f64::from)
    }

    /// Handler timeout for this queue, falling back to `default`.
    #[must_use]
    pub fn handler_timeout(&self, default: Duration) -> Duration {
        self.handler_timeout_seconds
            .map_or(default, Duration::from_secs)
    }

    fn validate(&self) -> QueueResult<()> {
        let name = &self.name;
        if name.trim().is_empty() {
            return Err(QueueError::Config("queue name must not be empty".into()));
        }
        if self.target.trim().is_empty() {
            return Err(QueueError::Config(format!("queue {name}: target must not be empty")));
        }
        if self.max_concurrent_requests == 0 {
            return Err(QueueError::Config(format!(
                "queue {name}: max_concurrent_requests must be at least 1"
            )));
        }
        if self.bucket_size == Some(0) {
            return Err(QueueError::Config(format!("queue {name}: bucket_size must be at least 1")));
        }
        if self.handler_timeout_seconds == Some(0) {
            return Err(QueueError::Config(format!(
                "queue {name}: handler_timeout_seconds must be positive"
            )));
        }

        let retry = &self.retry_parameters;
        if !retry.min_backoff_seconds.is_finite() || retry.min_backoff_seconds <= 0.0 {
            return Err(QueueError::Config(format!(
                "queue {name}: min_backoff_seconds must be positive"
            )));
        }
        match retry.max_backoff_seconds {
            Some(max) if !max.is_finite() || max < retry.min_backoff_seconds => {
                return Err(QueueError::Config(format!(
                    "queue {name}: max_backoff_seconds must be at least min_backoff_seconds"
                )));
            }
            _ => {}
        }

        Ok(())
    }
}

/// On-disk shape of `queue.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueManifest {
    /// Queue records.
    pub queue: Vec<QueueDefinition>,
}

/// Registry of queues keyed by name.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    queues: BTreeMap<String, Arc<QueueDefinition>>,
}

impl QueueRegistry {
    /// Build a registry, rejecting duplicate or invalid definitions.
    pub fn new(definitions: impl IntoIterator<Item = QueueDefinition>) -> QueueResult<Self> {
        let mut queues = BTreeMap::new();

        for definition in definitions {
            definition.validate()?;
            let name = definition.name.clone();
            if queues.insert(name.clone(), Arc::new(definition)).is_some() {
                return Err(QueueError::Config(format!("duplicate queue name: {name}")));
            }
        }

        Ok(Self { queues })
    }

    /// Parse `queue.yaml` contents.
    pub fn from_yaml_str(yaml: &str) -> QueueResult<Self> {
        let manifest: QueueManifest = serde_yaml::from_str(yaml)?;
        Self::new(manifest.queue)
    }

    /// Read and parse a `queue.yaml` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> QueueResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            QueueError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Look up a queue by name.
    pub fn lookup(&self, name: &str) -> QueueResult<Arc<QueueDefinition>> {
        self.queues
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    /// Iterate over definitions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<QueueDefinition>> {
        self.queues.values()
    }

    /// Queue names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Distinct targets referenced by the registered queues.
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self.queues.values().map(|q| q.target.as_str()).collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    /// Number of queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether no queues are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Rebuild the manifest this registry was loaded from.
    #[must_use]
    pub fn to_manifest(&self) -> QueueManifest {
        QueueManifest {
            queue: self.queues.values().map(|q| (**q).clone()).collect(),
        }
    }

    /// Serialize back to `queue.yaml` form.
    pub fn to_yaml(&self) -> QueueResult<String> {
        Ok(serde_yaml::to_string(&self.to_manifest())?)
    }
}
