//! Configuration module
//!
//! Provides structured configuration for the triage service.
//! Configuration can be loaded from:
//! 1. Default values (hardcoded)
//! 2. config.toml file (optional)
//! 3. Environment variables with TRIAGE__ prefix
//!
//! Example environment variable override:
//! TRIAGE__LOGGING__LEVEL=debug
//! TRIAGE__ORACLE__ENDPOINT=http://llm.internal:8080

use config::ConfigError;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub oracle: OracleConfig,
    pub input: InputConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
    pub metrics: MetricsConfig,
    pub logging: LogConfig,
}

/// Classification oracle endpoint and model parameters
#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// Base URL of an OpenAI-compatible server (llama.cpp server or hosted API)
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Expected output format: "structured" or "legacy"
    pub mode: String,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Name of the environment variable holding the bearer credential
    pub api_key_env: String,
    /// File holding the bearer credential; takes precedence over `api_key_env`
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

/// Event source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    pub directory: PathBuf,
}

/// Result store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Sync each appended record to disk before reporting success
    pub fsync: bool,
}

/// Triage pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of events classified concurrently
    pub concurrency: usize,
    /// Extra attempts for events whose oracle call found the oracle unavailable
    pub oracle_retries: u32,
    pub retry_backoff_ms: u64,
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub listen_addr: String,
}

/// Operational logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub directory: PathBuf,
    pub filename: String,
    pub console_output: bool,
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and environment variables
    pub fn new() -> Result<Self, ConfigError> {
        let s = config::Config::builder()
            // --- Defaults ---
            // Oracle
            .set_default("oracle.endpoint", "http://127.0.0.1:8080")?
            .set_default("oracle.model", "Phi-3-mini-4k-instruct-q4")?
            .set_default("oracle.temperature", 0.0)?
            .set_default("oracle.max_tokens", 512)?
            .set_default("oracle.mode", "structured")?
            .set_default("oracle.timeout_secs", 60)?
            .set_default("oracle.api_key_env", "TRIAGE_ORACLE_API_KEY")?
            // Input
            .set_default("input.directory", "triage-input")?
            // Store
            .set_default("store.path", "csv-data/triage_results.csv")?
            .set_default("store.fsync", true)?
            // Pipeline
            .set_default("pipeline.concurrency", 4)?
            .set_default("pipeline.oracle_retries", 0)?
            .set_default("pipeline.retry_backoff_ms", 500)?
            // Metrics
            .set_default("metrics.listen_addr", "0.0.0.0:8000")?
            // Logging
            .set_default("logging.level", "info")?
            .set_default("logging.directory", "logs")?
            .set_default("logging.filename", "falco-triage.log")?
            .set_default("logging.console_output", true)?
            // --- Sources ---
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("TRIAGE").separator("__"))
            .build()?;

        let cfg: AppConfig = s.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::Message(
                "pipeline.concurrency must be at least 1".to_string(),
            ));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(ConfigError::Message(
                "oracle.timeout_secs must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.oracle.temperature) {
            return Err(ConfigError::Message(format!(
                "oracle.temperature must be within 0.0..=2.0, got {}",
                self.oracle.temperature
            )));
        }
        if self.oracle.endpoint.trim().is_empty() {
            return Err(ConfigError::Message("oracle.endpoint is empty".to_string()));
        }
        self.oracle_mode()?;
        self.metrics_addr()?;
        Ok(())
    }

    pub fn oracle_mode(&self) -> Result<crate::validator::OracleMode, ConfigError> {
        self.oracle
            .mode
            .parse()
            .map_err(|err: String| ConfigError::Message(format!("oracle.mode: {}", err)))
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.metrics.listen_addr.parse().map_err(|err| {
            ConfigError::Message(format!(
                "metrics.listen_addr '{}': {}",
                self.metrics.listen_addr, err
            ))
        })
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle.timeout_secs)
    }
}

impl OracleConfig {
    /// Resolve the bearer credential from the key file or the configured
    /// environment variable. A missing credential is not an error: local
    /// model servers usually need none.
    pub fn resolve_api_key(&self) -> Result<Option<String>, ConfigError> {
        if let Some(path) = &self.api_key_file {
            let key = std::fs::read_to_string(path).map_err(|err| {
                ConfigError::Message(format!("oracle.api_key_file {:?}: {}", path, err))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::Message(format!(
                    "oracle.api_key_file {:?} is empty",
                    path
                )));
            }
            return Ok(Some(key.to_string()));
        }

        Ok(std::env::var(&self.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            oracle: OracleConfig {
                endpoint: "http://127.0.0.1:8080".to_string(),
                model: "Phi-3-mini-4k-instruct-q4".to_string(),
                temperature: 0.0,
                max_tokens: 512,
                mode: "structured".to_string(),
                timeout_secs: 60,
                api_key_env: "TRIAGE_ORACLE_API_KEY".to_string(),
                api_key_file: None,
            },
            input: InputConfig {
                directory: PathBuf::from("triage-input"),
            },
            store: StoreConfig {
                path: PathBuf::from("csv-data/triage_results.csv"),
                fsync: true,
            },
            pipeline: PipelineConfig {
                concurrency: 4,
                oracle_retries: 0,
                retry_backoff_ms: 500,
            },
            metrics: MetricsConfig {
                listen_addr: "0.0.0.0:8000".to_string(),
            },
            logging: LogConfig {
                level: "info".to_string(),
                directory: PathBuf::from("logs"),
                filename: "falco-triage.log".to_string(),
                console_output: true,
            },
        }
    }
}
