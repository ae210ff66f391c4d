use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration structure for the dispatch service
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Monthly spend ledger and model tiers
    pub budget: BudgetConfig,
    /// Job and provider retry policy
    pub retry: RetryConfig,
    /// Failure alerting
    pub alerts: AlertConfig,
    /// Per-agent worker settings, keyed by agent name
    pub agents: BTreeMap<String, AgentSettings>,
    /// Queue housekeeping
    pub queue: QueueConfig,
    /// Event bus limits
    pub events: EventConfig,
    /// Edge middleware
    pub edge: EdgeConfig,
    /// Compute provider endpoint
    pub provider: ProviderConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployEnvironment {
    Development,
    Production,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind: String,
    pub environment: DeployEnvironment,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelPrice {
    /// USD per million input units
    pub input_per_million: f64,
    /// USD per million output units
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    /// Budget applied when a period row is created lazily
    pub monthly_limit_usd: f64,
    /// How long a cached SpendPeriod read stays fresh
    pub cache_ttl_seconds: u64,
    /// Fraction of the monthly budget one agent may spend before a soft warning
    pub agent_warning_ratio: f64,
    pub primary_model: String,
    pub fallback_model: String,
    pub prices: BTreeMap<String, ModelPrice>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts per job, including the first
    pub job_attempts: u32,
    /// First job backoff delay; doubles on each retry
    pub job_backoff_base_ms: u64,
    /// Attempts per costed provider call
    pub provider_attempts: u32,
    pub provider_backoff_base_ms: u64,
    pub provider_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertConfig {
    /// Consecutive failures before an agent alert fires
    pub streak_threshold: u32,
    /// Minimum gap between two alerts for the same agent
    pub cooldown_seconds: u64,
    /// Slack-compatible incoming webhook; alerts only go to the log when unset
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Concurrent job slots for this agent's pool
    pub concurrency: usize,
    /// Critical agents keep running on the fallback tier past budget exhaustion
    pub critical: bool,
    /// Jobs started per rate window
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    /// Job types that must have a registered handler at startup
    #[serde(default)]
    pub job_types: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            critical: false,
            rate_limit_max: 10,
            rate_limit_window_ms: 1_000,
            job_types: Vec::new(),
        }
    }
}

impl AgentSettings {
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Idle workers re-check the store this often even without a wake-up
    pub poll_interval_ms: u64,
    /// Terminal jobs kept per queue for inspection
    pub keep_completed: usize,
    pub keep_failed: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventConfig {
    /// Longest allowed chain of event -> job -> event reactions
    pub max_depth: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EdgeConfig {
    pub cors_origins: Vec<String>,
    pub rate_limit_window_seconds: u64,
    pub rate_limit_max_requests: u32,
    /// Key rate limits on `x-forwarded-for`/`x-real-ip` instead of the peer
    /// address. Only safe behind a proxy that overwrites those headers.
    #[serde(default)]
    pub trust_proxy: bool,
    pub webhook_secret: Option<String>,
    pub internal_token: Option<String>,
    pub trigger_api_key: Option<String>,
    /// Route prefixes of features switched off for this deployment
    #[serde(default)]
    pub disabled_features: Vec<String>,
    /// Terms that must never appear in generated-content payloads
    #[serde(default)]
    pub blocked_terms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub requests_per_second: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let mut prices = BTreeMap::new();
        prices.insert(
            "primary".to_string(),
            ModelPrice {
                input_per_million: 3.00,
                output_per_million: 15.00,
            },
        );
        prices.insert(
            "fallback".to_string(),
            ModelPrice {
                input_per_million: 0.80,
                output_per_million: 4.00,
            },
        );

        Self {
            server: ServerConfig {
                bind: "0.0.0.0:8080".to_string(),
                environment: DeployEnvironment::Development,
            },
            budget: BudgetConfig {
                monthly_limit_usd: 500.0,
                cache_ttl_seconds: 300, // 5 minutes
                agent_warning_ratio: 0.5,
                primary_model: "primary".to_string(),
                fallback_model: "fallback".to_string(),
                prices,
            },
            retry: RetryConfig {
                job_attempts: 3,
                job_backoff_base_ms: 5_000,
                provider_attempts: 3,
                provider_backoff_base_ms: 1_000,
                provider_backoff_max_ms: 30_000,
            },
            alerts: AlertConfig {
                streak_threshold: 3,
                cooldown_seconds: 3_600, // 1 hour
                webhook_url: None,
                timeout_ms: 5_000,
            },
            agents: BTreeMap::new(),
            queue: QueueConfig {
                poll_interval_ms: 1_000,
                keep_completed: 100,
                keep_failed: 500,
            },
            events: EventConfig { max_depth: 8 },
            edge: EdgeConfig {
                cors_origins: vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:3001".to_string(),
                ],
                rate_limit_window_seconds: 60,
                rate_limit_max_requests: 100,
                trust_proxy: false,
                webhook_secret: None,
                internal_token: None,
                trigger_api_key: None,
                disabled_features: Vec::new(),
                blocked_terms: Vec::new(),
            },
            provider: ProviderConfig {
                endpoint: None,
                api_key: None,
                timeout_seconds: 120,
                requests_per_second: 5,
            },
            database: None,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (agent-dispatch.toml, or `path` when given)
    /// 3. Environment variables (prefixed with AGENT_DISPATCH__)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Config::try_from(&DispatchConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None if Path::new("agent-dispatch.toml").exists() => {
                builder = builder.add_source(File::with_name("agent-dispatch"));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("AGENT_DISPATCH")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("edge.cors_origins")
                .with_list_parse_key("edge.disabled_features")
                .with_list_parse_key("edge.blocked_terms")
                .try_parsing(true),
        );

        let config: DispatchConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load .env file if it exists
    pub fn load_env_file() {
        if Path::new(".env").exists() {
            match dotenvy::dotenv() {
                Ok(_) => tracing::info!("Loaded environment variables from .env file"),
                Err(e) => tracing::warn!("Failed to read .env file: {}", e),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.budget.monthly_limit_usd <= 0.0 {
            return Err(ConfigError::Invalid(
                "budget.monthly_limit_usd must be positive".to_string(),
            ));
        }
        if self.retry.job_attempts == 0 || self.retry.provider_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if self.alerts.streak_threshold == 0 {
            return Err(ConfigError::Invalid(
                "alerts.streak_threshold must be at least 1".to_string(),
            ));
        }
        if self.edge.rate_limit_window_seconds == 0 || self.edge.rate_limit_max_requests == 0 {
            return Err(ConfigError::Invalid(
                "edge rate limit window and ceiling must be non-zero".to_string(),
            ));
        }
        for (name, agent) in &self.agents {
            if agent.concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "agent '{name}' must have concurrency >= 1"
                )));
            }
            if agent.rate_limit_max == 0 || agent.rate_limit_window_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "agent '{name}' rate limit window and ceiling must be non-zero"
                )));
            }
        }
        for model in [&self.budget.primary_model, &self.budget.fallback_model] {
            if !self.budget.prices.contains_key(model) {
                return Err(ConfigError::Invalid(format!(
                    "no price configured for model '{model}'"
                )));
            }
        }
        Ok(())
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn is_production(&self) -> bool {
        self.server.environment == DeployEnvironment::Production
    }
}
