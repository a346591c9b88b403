use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::backends::LlmClientConfig;
use crate::policy::{AdvantageConfig, GroupConfig, PolicyConfig, RewardWeights};
use crate::query_engine::{PipelineConfig, ServiceConfig, StreamConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_timeout_seconds: u64,
    pub data_db_path: PathBuf,
    pub store_db_path: PathBuf,
    pub max_attempts: u32,
    pub execution_timeout_seconds: u64,
    pub default_max_rows: usize,
    pub schema_top_k: usize,
    pub stream_capacity: usize,
    pub stream_heartbeat_seconds: u64,
    pub stream_grace_seconds: u64,
    pub response_ttl_seconds: u64,
    pub group_size: usize,
    pub scale_rewards: bool,
    pub clip_advantage: f64,
}

/// Read `key`, falling back to `default` when unset.
fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = env::var(key).unwrap_or_else(|_| default.into());
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let config = Self {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            api_port: env_or("API_PORT", "8000")?,
            llm_base_url: env::var("LLM_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8081".into()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "local-llm".into()),
            llm_api_key: env::var("LLM_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            llm_timeout_seconds: env_or("LLM_TIMEOUT_SECONDS", "120")?,
            data_db_path: PathBuf::from(env::var("DATA_DB_PATH").unwrap_or_else(|_| "./data/warehouse.db".into())),
            store_db_path: PathBuf::from(env::var("STORE_DB_PATH").unwrap_or_else(|_| "./data/feedback.db".into())),
            max_attempts: env_or("MAX_ATTEMPTS", "3")?,
            execution_timeout_seconds: env_or("EXECUTION_TIMEOUT_SECONDS", "30")?,
            default_max_rows: env_or("DEFAULT_MAX_ROWS", "1000")?,
            schema_top_k: env_or("SCHEMA_TOP_K", "10")?,
            stream_capacity: env_or("STREAM_CAPACITY", "100")?,
            stream_heartbeat_seconds: env_or("STREAM_HEARTBEAT_SECONDS", "30")?,
            stream_grace_seconds: env_or("STREAM_GRACE_SECONDS", "60")?,
            response_ttl_seconds: env_or("RESPONSE_TTL_SECONDS", "86400")?,
            group_size: env_or("GROUP_SIZE", "4")?,
            scale_rewards: env_or("SCALE_REWARDS", "true")?,
            clip_advantage: env_or("CLIP_ADVANTAGE", "4.0")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.stream_capacity == 0 {
            anyhow::bail!("STREAM_CAPACITY must be at least 1");
        }
        if self.default_max_rows == 0 {
            anyhow::bail!("DEFAULT_MAX_ROWS must be at least 1");
        }
        self.group_config().validate()
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- LLM endpoint: {} (model {})", self.llm_base_url, self.llm_model);
        info!("- LLM auth: {}", if self.llm_api_key.is_some() { "bearer token" } else { "none" });
        info!("- Data DB: {}", self.data_db_path.display());
        info!("- Feedback store: {}", self.store_db_path.display());
        info!("- Attempts: {} (execution timeout {}s)", self.max_attempts, self.execution_timeout_seconds);
        info!("- Default max rows: {}", self.default_max_rows);
        info!("- Schema top-k: {}", self.schema_top_k);
        info!(
            "- Step stream: capacity {}, heartbeat {}s, grace {}s",
            self.stream_capacity, self.stream_heartbeat_seconds, self.stream_grace_seconds
        );
        info!("- Response TTL: {}s", self.response_ttl_seconds);
        info!(
            "- Group size: {} (scale rewards: {}, clip ±{})",
            self.group_size, self.scale_rewards, self.clip_advantage
        );
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }

    pub fn llm_client_config(&self) -> LlmClientConfig {
        LlmClientConfig {
            base_url: self.llm_base_url.clone(),
            model: self.llm_model.clone(),
            api_key: self.llm_api_key.clone(),
            timeout: Duration::from_secs(self.llm_timeout_seconds),
            ..LlmClientConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_attempts: self.max_attempts,
            execution_timeout: Duration::from_secs(self.execution_timeout_seconds),
            default_max_rows: self.default_max_rows,
            schema_top_k: self.schema_top_k,
            ..PipelineConfig::default()
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            capacity: self.stream_capacity,
            heartbeat_interval: Duration::from_secs(self.stream_heartbeat_seconds),
            grace_period: Duration::from_secs(self.stream_grace_seconds),
        }
    }

    pub fn group_config(&self) -> GroupConfig {
        GroupConfig {
            group_size: self.group_size,
            advantage: AdvantageConfig {
                scale_rewards: self.scale_rewards,
                clip_bound: self.clip_advantage,
            },
            execution_timeout: Duration::from_secs(self.execution_timeout_seconds),
            schema_top_k: self.schema_top_k,
            ..GroupConfig::default()
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            pipeline: self.pipeline_config(),
            stream: self.stream_config(),
            policy: PolicyConfig::default(),
            group: self.group_config(),
            reward_weights: RewardWeights::default(),
            response_ttl: Duration::from_secs(self.response_ttl_seconds),
            memory_window: crate::memory::DEFAULT_WINDOW_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper function to create a test Config with default values
    fn create_test_config() -> Config {
        Config {
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            llm_base_url: "http://127.0.0.1:8081".to_string(),
            llm_model: "local-llm".to_string(),
            llm_api_key: None,
            llm_timeout_seconds: 120,
            data_db_path: PathBuf::from("./data/warehouse.db"),
            store_db_path: PathBuf::from("./data/feedback.db"),
            max_attempts: 3,
            execution_timeout_seconds: 30,
            default_max_rows: 1000,
            schema_top_k: 10,
            stream_capacity: 100,
            stream_heartbeat_seconds: 30,
            stream_grace_seconds: 60,
            response_ttl_seconds: 86_400,
            group_size: 4,
            scale_rewards: true,
            clip_advantage: 4.0,
        }
    }

    #[test]
    fn test_default_values_validate() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_api_addr_parsing() {
        let config = create_test_config();
        let addr = config.api_addr().unwrap();
        assert_eq!(addr.port(), 8000);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_api_addr_with_zero_address() {
        let mut config = create_test_config();
        config.api_host = "0.0.0.0".to_string();
        assert!(config.api_addr().unwrap().ip().is_unspecified());
    }

    #[test]
    fn test_invalid_api_host_is_an_error() {
        let mut config = create_test_config();
        config.api_host = "not a host".to_string();
        assert!(config.api_addr().is_err());
    }

    #[test]
    fn test_group_size_out_of_range_rejected() {
        let mut config = create_test_config();
        config.group_size = 1;
        assert!(config.validate().is_err());
        config.group_size = 17;
        assert!(config.validate().is_err());
        config.group_size = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_finite_clip_advantage_rejected() {
        let mut config = create_test_config();
        config.clip_advantage = f64::NAN;
        assert!(config.validate().is_err());
        config.clip_advantage = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = create_test_config();
        config.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sub_configs_carry_values() {
        let mut config = create_test_config();
        config.max_attempts = 5;
        config.stream_capacity = 8;
        config.scale_rewards = false;
        config.llm_api_key = Some("secret".into());

        let service = config.service_config();
        assert_eq!(service.pipeline.max_attempts, 5);
        assert_eq!(service.pipeline.execution_timeout, Duration::from_secs(30));
        assert_eq!(service.stream.capacity, 8);
        assert_eq!(service.stream.grace_period, Duration::from_secs(60));
        assert!(!service.group.advantage.scale_rewards);
        assert_eq!(service.group.execution_timeout, Duration::from_secs(30));
        assert_eq!(service.response_ttl, Duration::from_secs(86_400));
        assert_eq!(config.llm_client_config().api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_env_or_parses_and_reports_key() {
        std::env::set_var("SQLPILOT_TEST_PORT", "9100");
        let port: u16 = env_or("SQLPILOT_TEST_PORT", "1").unwrap();
        assert_eq!(port, 9100);

        std::env::set_var("SQLPILOT_TEST_BAD", "many");
        let err = env_or::<u32>("SQLPILOT_TEST_BAD", "1").unwrap_err();
        assert!(err.to_string().contains("SQLPILOT_TEST_BAD"));

        let fallback: bool = env_or("SQLPILOT_TEST_UNSET_FLAG", "true").unwrap();
        assert!(fallback);
    }
}
