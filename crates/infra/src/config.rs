//! Configuration loading and representation.
//!
//! Every policy constant of the pipeline lives here with its default; the logic only
//! ever reads it from a [`PipelineConfig`].

use std::time::Duration;

use docflow_core::DocumentKind;
use docflow_events::QueueTopology;

use crate::jobs::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Thresholds and targets used by the downstream router.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPolicy {
    /// Documents classified below this confidence go to human review.
    pub review_confidence_threshold: f64,
    /// Documents whose extraction quality (0-100) is below this go to human review.
    pub review_quality_threshold: f64,
    pub urgent_confidence_below: f64,
    pub urgent_quality_below: f64,
    /// Kinds that represent monetary transactions and may be posted to the ledger.
    pub monetary_kinds: Vec<DocumentKind>,
    /// Stage name of the ledger-posting pipeline (`<stage>.primary` receives jobs).
    pub ledger_stage: String,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            review_confidence_threshold: 0.8,
            review_quality_threshold: 70.0,
            urgent_confidence_below: 0.5,
            urgent_quality_below: 50.0,
            monetary_kinds: vec![DocumentKind::Invoice, DocumentKind::Receipt],
            ledger_stage: "ledger".to_string(),
        }
    }
}

impl RoutingPolicy {
    pub fn is_monetary(&self, kind: &DocumentKind) -> bool {
        self.monetary_kinds.contains(kind)
    }
}

/// Worker configuration for one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Reported as `service` in queue telemetry.
    pub service_name: String,
    pub stage: String,
    /// Retry budget: a job is dead-lettered once `attempts + 1` exceeds this.
    pub max_retries: u32,
    /// TTL of the retry queue.
    pub retry_delay: Duration,
    pub classify_timeout: Duration,
    /// How long one receive call waits for a message.
    pub receive_wait: Duration,
    /// Pause after a broker error before polling again.
    pub error_backoff: Duration,
    /// Dead-letter immediately when the document no longer exists instead of retrying.
    pub dead_letter_missing_documents: bool,
    pub routing: RoutingPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            service_name: "docflow-classification-worker".to_string(),
            stage: "classification".to_string(),
            max_retries: 5,
            retry_delay: Duration::from_secs(15),
            classify_timeout: Duration::from_secs(30),
            receive_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            dead_letter_missing_documents: false,
            routing: RoutingPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `DOCFLOW_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment, test map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("DOCFLOW_SERVICE_NAME") {
            cfg.service_name = v;
        }
        if let Some(v) = lookup("DOCFLOW_STAGE") {
            cfg.stage = non_empty("DOCFLOW_STAGE", v)?;
        }
        if let Some(v) = lookup("DOCFLOW_MAX_RETRIES") {
            cfg.max_retries = parse("DOCFLOW_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_RETRY_DELAY_MS") {
            cfg.retry_delay = Duration::from_millis(parse("DOCFLOW_RETRY_DELAY_MS", &v)?);
        }
        if let Some(v) = lookup("DOCFLOW_CLASSIFY_TIMEOUT_MS") {
            cfg.classify_timeout = Duration::from_millis(parse("DOCFLOW_CLASSIFY_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("DOCFLOW_RECEIVE_WAIT_MS") {
            cfg.receive_wait = Duration::from_millis(parse("DOCFLOW_RECEIVE_WAIT_MS", &v)?);
        }
        if let Some(v) = lookup("DOCFLOW_ERROR_BACKOFF_MS") {
            cfg.error_backoff = Duration::from_millis(parse("DOCFLOW_ERROR_BACKOFF_MS", &v)?);
        }
        if let Some(v) = lookup("DOCFLOW_DEAD_LETTER_MISSING_DOCUMENTS") {
            cfg.dead_letter_missing_documents = parse("DOCFLOW_DEAD_LETTER_MISSING_DOCUMENTS", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_REVIEW_CONFIDENCE_THRESHOLD") {
            cfg.routing.review_confidence_threshold =
                unit_interval("DOCFLOW_REVIEW_CONFIDENCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_REVIEW_QUALITY_THRESHOLD") {
            cfg.routing.review_quality_threshold = parse("DOCFLOW_REVIEW_QUALITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_LEDGER_STAGE") {
            cfg.routing.ledger_stage = non_empty("DOCFLOW_LEDGER_STAGE", v)?;
        }
        if let Some(v) = lookup("DOCFLOW_URGENT_CONFIDENCE_BELOW") {
            cfg.routing.urgent_confidence_below = unit_interval("DOCFLOW_URGENT_CONFIDENCE_BELOW", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_URGENT_QUALITY_BELOW") {
            cfg.routing.urgent_quality_below = parse("DOCFLOW_URGENT_QUALITY_BELOW", &v)?;
        }
        if let Some(v) = lookup("DOCFLOW_MONETARY_KINDS") {
            cfg.routing.monetary_kinds = monetary_kinds("DOCFLOW_MONETARY_KINDS", &v)?;
        }

        Ok(cfg)
    }

    pub fn topology(&self) -> QueueTopology {
        QueueTopology::new(&self.stage, self.retry_delay)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }

    /// Topology of the ledger-posting stage this worker forwards to.
    pub fn ledger_topology(&self) -> QueueTopology {
        QueueTopology::new(&self.routing.ledger_stage, self.retry_delay)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn unit_interval(key: &str, value: &str) -> Result<f64, ConfigError> {
    let parsed: f64 = parse(key, value)?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: "must be between 0 and 1".to_string(),
        });
    }
    Ok(parsed)
}

/// Comma-separated kinds. A name that is not a known kind is rejected.
fn monetary_kinds(key: &str, value: &str) -> Result<Vec<DocumentKind>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| match name.parse::<DocumentKind>() {
            Ok(kind) if kind != DocumentKind::Unknown => Ok(kind),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: value.to_string(),
                reason: format!("unknown document kind {name:?}"),
            }),
        })
        .collect()
}

fn non_empty(key: &str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(value)
}
