//! Environment-driven configuration for the whole core.
//!
//! Each component keeps its own closed config struct; this module reads the
//! recognized environment variables once at startup and fails fast on
//! malformed values.

use std::time::Duration;

use thiserror::Error;

use engine::EngineConfig;
use ingress::{IngressConfig, RateLimitConfig};
use processor::ProcessorConfig;
use validation::{ExecutorConfig, WorkspaceConfig};

/// Events older than this are evicted by the periodic store cleanup.
const EVENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {name} has invalid value '{value}': {reason}")]
    Invalid { name: &'static str, value: String, reason: String },
}

/// Fully-resolved runtime configuration.
pub struct CoreConfig {
    pub host: String,
    pub port: u16,
    pub ingress: IngressConfig,
    pub rate_limits: RateLimitConfig,
    pub engine: EngineConfig,
    pub processor: ProcessorConfig,
    pub executor: ExecutorConfig,
    pub workspace: WorkspaceConfig,
    /// Cadence of the event-store TTL sweep.
    pub cleanup_interval: Duration,
    pub event_ttl: Duration,
}

impl CoreConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read every recognized variable from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ingress = IngressConfig {
            source_host_secret: env_opt("SOURCE_HOST_WEBHOOK_SECRET"),
            issue_tracker_secret: env_opt("ISSUE_TRACKER_WEBHOOK_SECRET"),
            agent_secret: env_opt("AGENT_WEBHOOK_SECRET"),
            agent_internal_key: env_opt("AGENT_INTERNAL_KEY"),
            api_keys: env_opt("WEBHOOK_API_KEYS")
                .map(|keys| {
                    keys.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            master_key: env_opt("WEBHOOK_MASTER_KEY"),
            jwt_secret: env_opt("JWT_SECRET"),
            allow_unverified: false,
        };

        let mut engine = EngineConfig::default();
        if let Some(max) = env_parsed::<usize>("MAX_CONCURRENT_WORKFLOWS")? {
            engine.max_concurrent_workflows = max;
        }

        let mut executor = ExecutorConfig::default();
        if let Some(max) = env_parsed::<usize>("MAX_CONCURRENT_VALIDATIONS")? {
            executor.max_concurrent_validations = max;
        }
        if let Some(ms) = env_parsed::<u64>("VALIDATION_TIMEOUT_MS")? {
            executor.validation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parsed::<u64>("GIT_TIMEOUT_MS")? {
            executor.git_timeout = Duration::from_millis(ms);
        }

        let mut workspace = WorkspaceConfig::default();
        if let Some(ms) = env_parsed::<u64>("WORKSPACE_MAX_AGE_MS")? {
            workspace.max_age = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_parsed::<u64>("WORKSPACE_MAX_BYTES")? {
            workspace.max_total_bytes = bytes;
        }

        let cleanup_interval = env_parsed::<u64>("CLEANUP_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(60 * 60));

        Ok(Self {
            host: env_opt("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: env_parsed::<u16>("PORT")?.unwrap_or(8080),
            ingress,
            rate_limits: RateLimitConfig::default(),
            engine,
            processor: ProcessorConfig::default(),
            executor,
            workspace,
            cleanup_interval,
            event_ttl: EVENT_TTL,
        })
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        None => Ok(None),
        Some(value) => value.parse::<T>().map(Some).map_err(|err| ConfigError::Invalid {
            name,
            value,
            reason: err.to_string(),
        }),
    }
}
