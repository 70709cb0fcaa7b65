//! Runtime configuration and submission options.
//!
//! `QueueConfig` is process-level and read once from the environment;
//! `SubmitOptions` is the per-submission configuration surface.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

use silentq_core::{BackoffStrategy, Behavior, RetryPolicy};

use crate::operation::{FallbackContext, FallbackHandler, RetryContext, RetryHandler};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-level queue configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Queue used when a submission names none.
    pub default_queue: String,
    /// Retry policy used when a submission specifies none.
    pub default_retry: RetryPolicy,
    /// Delay between `boot()` completing and queue workers starting.
    pub boot_delay: Duration,
    /// SQLite file for durable operations; `None` selects the OS data dir.
    pub database_path: Option<PathBuf>,
    /// Publish `QueueStateChange` messages on the state bus.
    pub state_events: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            default_retry: RetryPolicy::default(),
            boot_delay: Duration::ZERO,
            database_path: None,
            state_events: true,
        }
    }
}

impl QueueConfig {
    /// Read configuration from `SILENTQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("SILENTQ_DEFAULT_QUEUE") {
            if name.trim().is_empty() {
                return Err(invalid("SILENTQ_DEFAULT_QUEUE", name, "queue name must not be empty"));
            }
            config.default_queue = name;
        }
        if let Some(raw) = lookup("SILENTQ_MAX_ATTEMPTS") {
            config.default_retry.max_attempts = parse_number("SILENTQ_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("SILENTQ_BASE_DELAY_MS") {
            config.default_retry.backoff.base_delay =
                Duration::from_millis(parse_number("SILENTQ_BASE_DELAY_MS", &raw)?);
        }
        if let Some(raw) = lookup("SILENTQ_BACKOFF") {
            config.default_retry.backoff.strategy = match raw.to_ascii_lowercase().as_str() {
                "fixed" => BackoffStrategy::Fixed,
                "exponential" => BackoffStrategy::Exponential,
                _ => return Err(invalid("SILENTQ_BACKOFF", raw, "expected 'fixed' or 'exponential'")),
            };
        }
        if let Some(raw) = lookup("SILENTQ_MULTIPLIER") {
            config.default_retry.backoff.multiplier = raw
                .parse::<f64>()
                .map_err(|e| invalid("SILENTQ_MULTIPLIER", raw.clone(), e.to_string()))?;
        }
        if let Some(raw) = lookup("SILENTQ_BOOT_DELAY_MS") {
            config.boot_delay = Duration::from_millis(parse_number("SILENTQ_BOOT_DELAY_MS", &raw)?);
        }
        if let Some(raw) = lookup("SILENTQ_DB_PATH") {
            config.database_path = Some(PathBuf::from(raw));
        }

        config
            .default_retry
            .validate()
            .map_err(|e| invalid("SILENTQ_MAX_ATTEMPTS/SILENTQ_MULTIPLIER", String::new(), e.to_string()))?;

        Ok(config)
    }

    /// Resolve the SQLite file location, falling back to the OS data dir.
    pub fn resolve_database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => default_database_path(),
        }
    }
}

fn invalid(key: &'static str, value: String, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value,
        reason: reason.into(),
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| invalid(key, raw.to_string(), e.to_string()))
}

/// `{app_data_dir}/silentq/queue.db`
///
/// Does not create anything; the SQLite adapter creates the directory on first use.
pub fn default_database_path() -> anyhow::Result<PathBuf> {
    let mut dir = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    dir.push("silentq");
    dir.push("queue.db");
    Ok(dir)
}

/// Per-submission configuration surface.
#[derive(Clone, Default)]
pub struct SubmitOptions {
    pub behavior: Behavior,
    /// Target queue; `None` uses `QueueConfig::default_queue`.
    pub queue: Option<String>,
    /// Mirror the operation to storage; `None` means "durable iff `Silent`".
    pub durable: Option<bool>,
    /// `None` uses `QueueConfig::default_retry`.
    pub retry: Option<RetryPolicy>,
    pub fallback: Vec<FallbackHandler>,
    pub on_retry: Vec<RetryHandler>,
    /// Optimistic result handed to a `Silent` caller.
    pub virtual_response: Value,
    /// JSON pointers into the result whose values are deferred.
    pub deferred_fields: Vec<String>,
    /// Key of application state this operation optimistically mutated.
    pub linked_state: Option<String>,
}

impl std::fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("behavior", &self.behavior)
            .field("queue", &self.queue)
            .field("durable", &self.durable)
            .field("retry", &self.retry)
            .field("fallback", &self.fallback.len())
            .field("on_retry", &self.on_retry.len())
            .field("deferred_fields", &self.deferred_fields)
            .field("linked_state", &self.linked_state)
            .finish()
    }
}

impl SubmitOptions {
    pub fn silent() -> Self {
        Self {
            behavior: Behavior::Silent,
            ..Default::default()
        }
    }

    pub fn queued() -> Self {
        Self {
            behavior: Behavior::Queued,
            ..Default::default()
        }
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn fallback<F>(mut self, handler: F) -> Self
    where
        F: Fn(&FallbackContext) + Send + Sync + 'static,
    {
        self.fallback.push(std::sync::Arc::new(handler));
        self
    }

    pub fn on_retry<F>(mut self, handler: F) -> Self
    where
        F: Fn(&RetryContext) + Send + Sync + 'static,
    {
        self.on_retry.push(std::sync::Arc::new(handler));
        self
    }

    pub fn virtual_response(mut self, value: Value) -> Self {
        self.virtual_response = value;
        self
    }

    pub fn defer(mut self, pointer: impl Into<String>) -> Self {
        self.deferred_fields.push(pointer.into());
        self
    }

    pub fn linked_state(mut self, key: impl Into<String>) -> Self {
        self.linked_state = Some(key.into());
        self
    }

    pub(crate) fn resolved_durable(&self) -> bool {
        self.durable.unwrap_or(self.behavior == Behavior::Silent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = QueueConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn environment_overrides_retry_policy() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("SILENTQ_DEFAULT_QUEUE", "orders"),
            ("SILENTQ_MAX_ATTEMPTS", "5"),
            ("SILENTQ_BASE_DELAY_MS", "250"),
            ("SILENTQ_BACKOFF", "Fixed"),
            ("SILENTQ_BOOT_DELAY_MS", "1000"),
            ("SILENTQ_DB_PATH", "/tmp/q.db"),
        ]))
        .unwrap();

        assert_eq!(config.default_queue, "orders");
        assert_eq!(config.default_retry.max_attempts, 5);
        assert_eq!(config.default_retry.backoff.strategy, BackoffStrategy::Fixed);
        assert_eq!(config.default_retry.delay_for_attempt(3), Duration::from_millis(250));
        assert_eq!(config.boot_delay, Duration::from_secs(1));
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/q.db")));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = QueueConfig::from_lookup(lookup(&[("SILENTQ_MAX_ATTEMPTS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SILENTQ_MAX_ATTEMPTS", .. }));

        let err = QueueConfig::from_lookup(lookup(&[("SILENTQ_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = QueueConfig::from_lookup(lookup(&[("SILENTQ_BACKOFF", "random")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SILENTQ_BACKOFF", .. }));
    }

    #[test]
    fn durability_defaults_follow_behavior() {
        assert!(SubmitOptions::silent().resolved_durable());
        assert!(!SubmitOptions::queued().resolved_durable());
        assert!(SubmitOptions::queued().durable(true).resolved_durable());
    }
}
