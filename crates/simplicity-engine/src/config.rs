//! Configuration types for the analysis engine.
//!
//! All configuration is loaded from environment variables. The engine needs
//! to know how to reach the generative-analysis collaborator, where the
//! prompt templates live, where (if anywhere) to publish snapshots, and the
//! scheduling tunables of the orchestration loop.
//!
//! Every numeric threshold here is tuned policy ("small ratio, short
//! seconds, few retries"), not load-bearing architecture.

use std::time::Duration;

use crate::error::EngineError;

/// Complete engine configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Generative-analysis backend configuration.
    pub backend: BackendConfig,
    /// NATS URL for the metrics publisher; `None` disables publishing.
    pub metrics_url: Option<String>,
    /// Path to the prompt templates directory.
    pub templates_dir: String,
    /// Scheduling tunables for the orchestration loop.
    pub timing: TimingConfig,
    /// Eviction policy for the contribution store.
    pub eviction: EvictionPolicy,
    /// Retry budget for the two analysis stages.
    pub retry: RetryConfig,
    /// Maximum output tokens requested from the backend.
    pub max_output_tokens: u32,
    /// Maximum length of free-text fields injected into prompts.
    pub text_truncate_len: usize,
    /// Minimum canvas image payload size considered analyzable.
    pub min_image_bytes: usize,
}

/// Configuration for the generative-analysis backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// The backend type (gemini or an OpenAI-compatible API).
    pub backend_type: BackendType,
    /// Base API URL.
    pub api_url: String,
    /// API key for authentication.
    pub api_key: String,
    /// Model identifier.
    pub model: String,
}

/// Supported generative-analysis backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Google `generateContent` API (native inline-image support).
    Gemini,
    /// `OpenAI`-compatible chat completions API.
    OpenAi,
}

/// Adaptive timeouts for contribution-store eviction.
///
/// A brand-new agent that stops reporting is dropped quickly; an agent that
/// has survived a full analysis cycle is given minutes, because the external
/// analysis stages themselves can legitimately take minutes between its
/// reports. An agent whose current predictions have not been evaluated yet
/// gets an extra grace window -- those predictions are the next cycle's
/// baseline.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Timeout for an agent that has never completed a cycle.
    pub fresh_timeout: Duration,
    /// Extra grace on top of `fresh_timeout` for an agent whose predictions
    /// are awaiting their first evaluation.
    pub pending_grace: Duration,
    /// Timeout once the agent has completed at least one full cycle.
    pub settled_timeout: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            fresh_timeout: Duration::from_secs(60),
            pending_grace: Duration::from_secs(120),
            settled_timeout: Duration::from_secs(480),
        }
    }
}

/// Scheduling tunables for the orchestration loop.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Interval between readiness evaluations.
    pub poll_interval: Duration,
    /// Minimum elapsed time since the first canvas update before the first
    /// cycle may start.
    pub warmup_delay: Duration,
    /// Absolute warmup bound: after this, the first cycle starts with
    /// whatever has been reported.
    pub warmup_timeout: Duration,
    /// Fraction of declared agents that must have reported before the
    /// first cycle (floor 2; exactly 1 when one agent is declared).
    pub warmup_min_ratio: f64,
    /// Contribution-store debounce window before the first cycle.
    pub quiescence_first: Duration,
    /// Contribution-store debounce window for subsequent cycles.
    pub quiescence_steady: Duration,
    /// Canvas+contribution staleness bound before the first cycle; both
    /// sides stale past this means the session disconnected.
    pub disconnect_early: Duration,
    /// Staleness bound once cycles are flowing.
    pub disconnect_steady: Duration,
    /// The canvas image must have been refreshed within this window.
    pub image_fresh_window: Duration,
    /// The image may trail the newest contribution by at most this much.
    pub image_lag_tolerance: Duration,
    /// Absolute bound on waiting for quiescence/freshness: after this, the
    /// cycle runs with whatever state is available.
    pub ready_wait_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            warmup_delay: Duration::from_secs(30),
            warmup_timeout: Duration::from_secs(60),
            warmup_min_ratio: 0.75,
            quiescence_first: Duration::from_secs(6),
            quiescence_steady: Duration::from_secs(5),
            disconnect_early: Duration::from_secs(60),
            disconnect_steady: Duration::from_secs(300),
            image_fresh_window: Duration::from_secs(30),
            image_lag_tolerance: Duration::from_secs(2),
            ready_wait_timeout: Duration::from_secs(120),
        }
    }
}

/// Retry budget for a single analysis stage invocation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per cycle (first try included).
    pub attempts: u32,
    /// Base delay; attempt `n` waits `base_delay * n` before retrying.
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(3),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Required variables:
    /// - `ANALYSIS_BACKEND` -- `gemini` or `openai`
    /// - `ANALYSIS_API_URL` -- backend base URL
    /// - `ANALYSIS_API_KEY` -- backend API key
    /// - `ANALYSIS_MODEL` -- model identifier
    ///
    /// Optional variables (with defaults):
    /// - `METRICS_NATS_URL` -- snapshot publish target (unset = disabled)
    /// - `TEMPLATES_DIR` -- prompt templates directory (default `templates`)
    /// - `POLL_INTERVAL_MS` (2000), `WARMUP_DELAY_SECS` (30),
    ///   `WARMUP_TIMEOUT_SECS` (60), `WARMUP_MIN_RATIO` (0.75)
    /// - `QUIESCENCE_FIRST_SECS` (6), `QUIESCENCE_STEADY_SECS` (5)
    /// - `FRESH_AGENT_TIMEOUT_SECS` (60), `PENDING_GRACE_SECS` (120),
    ///   `SETTLED_AGENT_TIMEOUT_SECS` (480)
    /// - `DISCONNECT_EARLY_SECS` (60), `DISCONNECT_STEADY_SECS` (300)
    /// - `IMAGE_FRESH_WINDOW_SECS` (30), `IMAGE_LAG_TOLERANCE_SECS` (2),
    ///   `READY_WAIT_TIMEOUT_SECS` (120)
    /// - `RETRY_ATTEMPTS` (3), `RETRY_BASE_DELAY_MS` (3000)
    /// - `MAX_OUTPUT_TOKENS` (16000), `TEXT_TRUNCATE_LEN` (200),
    ///   `MIN_IMAGE_BYTES` (1000)
    pub fn from_env() -> Result<Self, EngineError> {
        let backend = load_backend_config("ANALYSIS")?;
        let metrics_url = std::env::var("METRICS_NATS_URL").ok();
        let templates_dir =
            std::env::var("TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_owned());

        let timing = TimingConfig {
            poll_interval: env_millis("POLL_INTERVAL_MS", 2000)?,
            warmup_delay: env_secs("WARMUP_DELAY_SECS", 30)?,
            warmup_timeout: env_secs("WARMUP_TIMEOUT_SECS", 60)?,
            warmup_min_ratio: env_parse("WARMUP_MIN_RATIO", 0.75)?,
            quiescence_first: env_secs("QUIESCENCE_FIRST_SECS", 6)?,
            quiescence_steady: env_secs("QUIESCENCE_STEADY_SECS", 5)?,
            disconnect_early: env_secs("DISCONNECT_EARLY_SECS", 60)?,
            disconnect_steady: env_secs("DISCONNECT_STEADY_SECS", 300)?,
            image_fresh_window: env_secs("IMAGE_FRESH_WINDOW_SECS", 30)?,
            image_lag_tolerance: env_secs("IMAGE_LAG_TOLERANCE_SECS", 2)?,
            ready_wait_timeout: env_secs("READY_WAIT_TIMEOUT_SECS", 120)?,
        };

        let eviction = EvictionPolicy {
            fresh_timeout: env_secs("FRESH_AGENT_TIMEOUT_SECS", 60)?,
            pending_grace: env_secs("PENDING_GRACE_SECS", 120)?,
            settled_timeout: env_secs("SETTLED_AGENT_TIMEOUT_SECS", 480)?,
        };

        let retry = RetryConfig {
            attempts: env_parse("RETRY_ATTEMPTS", 3)?,
            base_delay: env_millis("RETRY_BASE_DELAY_MS", 3000)?,
        };

        Ok(Self {
            backend,
            metrics_url,
            templates_dir,
            timing,
            eviction,
            retry,
            max_output_tokens: env_parse("MAX_OUTPUT_TOKENS", 16_000)?,
            text_truncate_len: env_parse("TEXT_TRUNCATE_LEN", 200)?,
            min_image_bytes: env_parse("MIN_IMAGE_BYTES", 1000)?,
        })
    }
}

/// Read a required environment variable.
fn env_var(name: &str) -> Result<String, EngineError> {
    std::env::var(name)
        .map_err(|e| EngineError::Config(format!("missing required env var {name}: {e}")))
}

/// Read an optional environment variable and parse it, falling back to a
/// default when unset.
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, EngineError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| EngineError::Config(format!("invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Read an optional duration expressed in whole seconds.
fn env_secs(name: &str, default: u64) -> Result<Duration, EngineError> {
    env_parse(name, default).map(Duration::from_secs)
}

/// Read an optional duration expressed in milliseconds.
fn env_millis(name: &str, default: u64) -> Result<Duration, EngineError> {
    env_parse(name, default).map(Duration::from_millis)
}

/// Load a backend config from a set of prefixed environment variables.
fn load_backend_config(prefix: &str) -> Result<BackendConfig, EngineError> {
    let backend_str = env_var(&format!("{prefix}_BACKEND"))?;
    let api_url = env_var(&format!("{prefix}_API_URL"))?;
    let api_key = env_var(&format!("{prefix}_API_KEY"))?;
    let model = env_var(&format!("{prefix}_MODEL"))?;

    let backend_type = match backend_str.to_lowercase().as_str() {
        "gemini" | "google" => BackendType::Gemini,
        "openai" | "deepseek" | "ollama" => BackendType::OpenAi,
        other => {
            return Err(EngineError::Config(format!(
                "unknown backend type: {other}"
            )));
        }
    };

    Ok(BackendConfig {
        backend_type,
        api_url,
        api_key,
        model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_defaults_are_ordered() {
        let timing = TimingConfig::default();
        assert!(timing.warmup_delay < timing.warmup_timeout);
        assert!(timing.quiescence_steady <= timing.quiescence_first);
        assert!(timing.disconnect_early < timing.disconnect_steady);
    }

    #[test]
    fn eviction_defaults_escalate() {
        let policy = EvictionPolicy::default();
        assert!(policy.fresh_timeout < policy.settled_timeout);
        assert!(policy.pending_grace > Duration::ZERO);
    }

    #[test]
    fn retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(3));
    }
}
