//! Configuration loaded from the environment.
//!
//! `.env` is honored via `dotenvy`. Every knob has a default so an empty
//! environment yields a working (credential-less) configuration; provider
//! credentials are only required when an agent actually needs them.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::sandbox::INACTIVITY_TIMEOUT;

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub llm: LlmConfig,
    pub rate_limit: RateLimitConfig,
    pub executor: ExecutorConfig,
    pub session: SessionConfig,
    pub network: NetworkConfig,
    pub bus: BusConfig,
    /// Directory with additional system agent definitions (`*.json`).
    pub agents_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process environment (and `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let defaults = Config::default();
        Ok(Self {
            llm: LlmConfig {
                anthropic_api_key: secret("ANTHROPIC_API_KEY"),
                anthropic_base_url: env_or(
                    "ANTHROPIC_BASE_URL",
                    defaults.llm.anthropic_base_url.clone(),
                )?,
                openai_api_key: secret("OPENAI_API_KEY"),
                openai_base_url: env_or("OPENAI_BASE_URL", defaults.llm.openai_base_url.clone())?,
                request_timeout: secs("CONDUCTOR_LLM_TIMEOUT_SECS", defaults.llm.request_timeout)?,
                max_tokens: env_or("CONDUCTOR_LLM_MAX_TOKENS", defaults.llm.max_tokens)?,
            },
            rate_limit: RateLimitConfig {
                max_concurrent: env_or(
                    "CONDUCTOR_LLM_MAX_CONCURRENT",
                    defaults.rate_limit.max_concurrent,
                )?,
                min_interval: millis(
                    "CONDUCTOR_LLM_MIN_INTERVAL_MS",
                    defaults.rate_limit.min_interval,
                )?,
            },
            executor: ExecutorConfig {
                max_attempts: env_or("CONDUCTOR_MAX_ATTEMPTS", defaults.executor.max_attempts)?,
                max_tool_rounds: env_or(
                    "CONDUCTOR_MAX_TOOL_ROUNDS",
                    defaults.executor.max_tool_rounds,
                )?,
            },
            session: SessionConfig {
                inactivity_timeout: secs(
                    "CONDUCTOR_SESSION_TTL_SECS",
                    defaults.session.inactivity_timeout,
                )?,
                max_age: secs("CONDUCTOR_SESSION_MAX_AGE_SECS", defaults.session.max_age)?,
                cwd: env_or("CONDUCTOR_SESSION_CWD", defaults.session.cwd.clone())?,
                ..defaults.session
            },
            network: NetworkConfig {
                max_iter: env_or("CONDUCTOR_NETWORK_MAX_ITER", defaults.network.max_iter)?,
                max_custom_agents: env_or(
                    "CONDUCTOR_MAX_CUSTOM_AGENTS",
                    defaults.network.max_custom_agents,
                )?,
                default_model: env_or(
                    "CONDUCTOR_DEFAULT_MODEL",
                    defaults.network.default_model.clone(),
                )?,
                ..defaults.network
            },
            bus: BusConfig {
                token_ttl: secs("CONDUCTOR_TOKEN_TTL_SECS", defaults.bus.token_ttl)?,
                max_subscribers: env_or(
                    "CONDUCTOR_MAX_SUBSCRIBERS",
                    defaults.bus.max_subscribers,
                )?,
            },
            agents_dir: std::env::var("CONDUCTOR_AGENTS_DIR")
                .ok()
                .map(PathBuf::from)
                .or_else(|| dirs::config_dir().map(|d| d.join("conductor").join("agents"))),
        })
    }
}

/// Provider credentials and endpoints.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<SecretString>,
    pub anthropic_base_url: String,
    pub openai_api_key: Option<SecretString>,
    pub openai_base_url: String,
    pub request_timeout: Duration,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com".to_string(),
            request_timeout: Duration::from_secs(120),
            max_tokens: 4096,
        }
    }
}

/// Process-wide provider call budget.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Provider calls allowed in flight at once.
    pub max_concurrent: usize,
    /// Minimum spacing between call starts.
    pub min_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            min_interval: Duration::from_millis(250),
        }
    }
}

/// Task executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    /// Tool-use round trips allowed within one attempt.
    pub max_tool_rounds: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_tool_rounds: 8,
        }
    }
}

/// Interactive session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TTL of the persisted descriptor; matches the sandbox inactivity timeout.
    pub inactivity_timeout: Duration,
    /// Sessions older than this are unhealthy regardless of activity.
    pub max_age: Duration,
    /// Liveness check interval of the health monitor.
    pub health_interval: Duration,
    /// Interval at which the monitor notices its session has stopped.
    pub cleanup_interval: Duration,
    pub cols: u16,
    pub rows: u16,
    /// Working directory of the interactive process (and watch root).
    pub cwd: String,
    /// TTL of the per-workspace send lease.
    pub lease_ttl: Duration,
    /// How long `send` waits for the lease before giving up.
    pub lease_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: INACTIVITY_TIMEOUT,
            max_age: Duration::from_secs(4 * 60 * 60),
            health_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5),
            cols: 120,
            rows: 30,
            cwd: ".".to_string(),
            lease_ttl: Duration::from_secs(10),
            lease_wait: Duration::from_secs(2),
        }
    }
}

/// Orchestration network settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Hard ceiling on agent turns per run.
    pub max_iter: usize,
    /// Upper bound on custom agents per team.
    pub max_custom_agents: usize,
    /// How deep `delegate_task` may nest.
    pub max_delegation_depth: usize,
    /// Model for created agents that don't specify one.
    pub default_model: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_iter: 10,
            max_custom_agents: 32,
            max_delegation_depth: 2,
            default_model: "claude-sonnet-4-5".to_string(),
        }
    }
}

/// Realtime bus settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub token_ttl: Duration,
    pub max_subscribers: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(60 * 60),
            max_subscribers: 100,
        }
    }
}

fn secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.session.health_interval, Duration::from_secs(30));
        assert_eq!(config.session.cleanup_interval, Duration::from_secs(5));
        assert_eq!(config.session.max_age, Duration::from_secs(14_400));
        assert_eq!(config.session.inactivity_timeout, INACTIVITY_TIMEOUT);
        assert!(config.llm.anthropic_api_key.is_none());
        assert!(config.network.max_iter > 0);
    }

    #[test]
    fn test_env_or_parses_and_rejects() {
        // Unique keys so parallel tests don't interfere.
        unsafe {
            std::env::set_var("CONDUCTOR_TEST_PARSE_OK", " 7 ");
            std::env::set_var("CONDUCTOR_TEST_PARSE_BAD", "seven");
        }
        assert_eq!(env_or("CONDUCTOR_TEST_PARSE_OK", 1u32).unwrap(), 7);
        assert!(matches!(
            env_or("CONDUCTOR_TEST_PARSE_BAD", 1u32),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(env_or("CONDUCTOR_TEST_PARSE_MISSING", 5u32).unwrap(), 5);
    }
}
