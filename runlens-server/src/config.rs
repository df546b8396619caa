// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Runlens Server Configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LLMConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// HTTP API listen address (e.g., "127.0.0.1:3333")
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Enable CORS
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,

    /// Allowed CORS origins (empty = allow all)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
            request_timeout_secs: default_request_timeout(),
            enable_cors: default_enable_cors(),
            cors_origins: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Optional TOML file with custom model prices
    #[serde(default)]
    pub pricing_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            pricing_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LLMConfig {
    /// OpenAI API key; LLM-judged checks fail without one
    pub openai_api_key: Option<String>,

    /// OpenAI-compatible endpoint (defaults to api.openai.com)
    pub base_url: Option<String>,

    /// Judge model (defaults to gpt-4o-mini)
    pub model: Option<String>,
}

impl LLMConfig {
    pub fn model_or_default(&self) -> &str {
        self.model.as_deref().unwrap_or("gpt-4o-mini")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    /// Rows per cost backfill batch
    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: i64,

    /// Runs picked up per radar per pass
    #[serde(default = "default_radar_batch_size")]
    pub radar_batch_size: i64,

    /// Runs evaluated concurrently by the radar job
    #[serde(default = "default_radar_parallelism")]
    pub radar_parallelism: usize,

    /// Seconds between radar passes while serving (0 = never)
    #[serde(default = "default_radar_interval")]
    pub radar_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            backfill_batch_size: default_backfill_batch_size(),
            radar_batch_size: default_radar_batch_size(),
            radar_parallelism: default_radar_parallelism(),
            radar_interval_secs: default_radar_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json: bool,
}

// Default values
fn default_http_addr() -> String {
    "127.0.0.1:3333".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_enable_cors() -> bool {
    true
}

fn default_database_url() -> String {
    "sqlite://runlens.db".to_string()
}

fn default_backfill_batch_size() -> i64 {
    1000
}

fn default_radar_batch_size() -> i64 {
    20
}

fn default_radar_parallelism() -> usize {
    3
}

fn default_radar_interval() -> u64 {
    60
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - RUNLENS_LISTEN_ADDR: HTTP listen address (default: 127.0.0.1:3333)
    /// - RUNLENS_DATABASE_URL: SQLite URL (default: sqlite://runlens.db)
    /// - OPENAI_API_KEY: key for LLM-judged checks
    /// - RUNLENS_LOG_JSON: JSON log output (default: false)
    pub fn from_env() -> Self {
        Self::merge_with_env(Self::default())
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        let config = Self::merge_with_env(config);
        config.validate()?;
        Ok(config)
    }

    /// Merge config with environment variables (env takes priority)
    fn merge_with_env(mut config: Self) -> Self {
        if let Ok(addr) = std::env::var("RUNLENS_LISTEN_ADDR") {
            config.server.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("RUNLENS_DATABASE_URL") {
            config.storage.database_url = url;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                config.llm.openai_api_key = Some(key);
            }
        }
        if let Ok(json) = std::env::var("RUNLENS_LOG_JSON") {
            config.logging.json = json.parse().unwrap_or(config.logging.json);
        }
        config
    }

    /// Parse listen address as SocketAddr
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if !self.storage.database_url.starts_with("sqlite:") {
            anyhow::bail!(
                "Unsupported database URL {}: only sqlite: URLs are supported",
                self.storage.database_url
            );
        }
        if self.jobs.backfill_batch_size <= 0 || self.jobs.radar_batch_size <= 0 {
            anyhow::bail!("Job batch sizes must be positive");
        }
        if self.jobs.radar_parallelism == 0 {
            anyhow::bail!("Radar parallelism must be at least 1");
        }

        Ok(())
    }
}
