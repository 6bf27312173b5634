//! Environment configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chat_api::ChatApiConfig;

pub const DEFAULT_STATE_DIR: &str = ".chat_engine";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SYNC_MAX_ATTEMPTS: u32 = 30;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CONTEXT_CAPACITY: u64 = 200_000;

/// Context-usage percentages at which the warning and danger levels begin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextThresholds {
    pub capacity: u64,
    pub warning_percent: f64,
    pub danger_percent: f64,
}

impl Default for ContextThresholds {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CONTEXT_CAPACITY,
            warning_percent: 70.0,
            danger_percent: 90.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub state_dir: PathBuf,
    pub timeout: Option<Duration>,
    /// Delay between reconciliation poll attempts.
    pub sync_interval: Duration,
    /// Poll attempts before a generating entry is given up on.
    pub sync_max_attempts: u32,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub context: ContextThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: chat_api::url::DEFAULT_BASE_URL.to_string(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            timeout: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            sync_max_attempts: DEFAULT_SYNC_MAX_ATTEMPTS,
            stale_after: chat_state::DEFAULT_STALE_AFTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            context: ContextThresholds::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `CHAT_ENGINE_*` variables that parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_string_opt("CHAT_ENGINE_BASE_URL").unwrap_or(defaults.base_url),
            state_dir: env_string_opt("CHAT_ENGINE_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            timeout: env_parse::<u64>("CHAT_ENGINE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .or(defaults.timeout),
            sync_interval: env_parse::<u64>("CHAT_ENGINE_SYNC_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_interval),
            sync_max_attempts: env_parse("CHAT_ENGINE_SYNC_MAX_ATTEMPTS")
                .unwrap_or(defaults.sync_max_attempts),
            stale_after: env_parse::<u64>("CHAT_ENGINE_STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            sweep_interval: env_parse::<u64>("CHAT_ENGINE_SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            context: ContextThresholds {
                capacity: env_parse::<u64>("CHAT_ENGINE_CONTEXT_CAPACITY")
                    .filter(|capacity| *capacity > 0)
                    .unwrap_or(defaults.context.capacity),
                ..defaults.context
            },
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn with_sync_policy(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.sync_interval = interval;
        self.sync_max_attempts = max_attempts;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// A zero interval is ignored, as it is for the environment variable.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        if !sweep_interval.is_zero() {
            self.sweep_interval = sweep_interval;
        }
        self
    }

    pub fn with_context(mut self, context: ContextThresholds) -> Self {
        self.context = context;
        self
    }

    /// Transport configuration derived from this engine configuration.
    pub fn api_config(&self) -> ChatApiConfig {
        let config = ChatApiConfig::new(self.base_url.clone());
        match self.timeout {
            Some(timeout) => config.with_timeout(timeout),
            None => config,
        }
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string_opt(key).and_then(|value| value.trim().parse().ok())
}
