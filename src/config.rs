//! # Configuration Management
//!
//! Loads gateway settings from several layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables (with APP__ prefix and `__` between levels)
//! - Deployment overrides (HOST, PORT, ASR_API_KEY, ASR_API_BASE, ASR_MODEL, ASR_SAMPLE_RATE)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the `config` crate deserializes the merged layers straight into these structs
//! - **#[serde(default)]**: a partial config.toml only needs the fields it changes
//! - **Result<T, E>**: loading and validation fail loudly at startup, never later
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment overrides (PORT, ASR_API_KEY, ...)
//! 2. Environment variables (APP__SERVER__PORT, APP__ASR__MODEL, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)

use crate::transcription::upstream::derive_websocket_url;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub asr: AsrConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Upstream speech recognition provider settings.
///
/// ## Fields:
/// - `base_url`: REST API base; the streaming socket base is derived from it
///   unless `ws_url` is set
/// - `api_key`: used when neither the request nor its headers carry a token
/// - `sample_rate`: assumed rate for raw PCM uploads and streams that omit one
/// - `stream_wait_base_secs` / `stream_wait_cap_secs`: bounds of the adaptive
///   wait for a final transcript
/// - `request_timeout_secs`: overall budget for one HTTP recognition request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    pub base_url: String,
    pub ws_url: Option<String>,
    pub api_key: String,
    pub model: String,
    pub sample_rate: u32,
    pub handshake_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub stream_wait_base_secs: u64,
    pub stream_wait_cap_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openai.qiniu.com/v1".to_string(),
            ws_url: None,
            api_key: String::new(),
            model: "asr".to_string(),
            sample_rate: 16000,
            handshake_timeout_secs: 10,
            http_timeout_secs: 20,
            stream_wait_base_secs: 90,
            stream_wait_cap_secs: 300,
            request_timeout_secs: 120,
        }
    }
}

impl AsrConfig {
    /// REST base without a trailing slash.
    pub fn rest_base(&self) -> String {
        self.base_url.trim().trim_end_matches('/').to_string()
    }

    /// Streaming socket base: the explicit `ws_url`, or one derived from `base_url`.
    ///
    /// Empty when neither is usable; streaming is then reported as not configured.
    pub fn websocket_base(&self) -> String {
        match self.ws_url.as_deref().map(str::trim) {
            Some(explicit) if !explicit.is_empty() => explicit.trim_end_matches('/').to_string(),
            _ => derive_websocket_url(&self.base_url),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn stream_wait_base(&self) -> Duration {
        Duration::from_secs(self.stream_wait_base_secs)
    }

    pub fn stream_wait_cap(&self) -> Duration {
        Duration::from_secs(self.stream_wait_cap_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Performance tuning configuration.
///
/// `max_concurrent_sessions` bounds how many client streams may hold an
/// upstream session at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
        }
    }
}

/// Deployment-style variables that map onto one config key each.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("ASR_API_KEY", "asr.api_key"),
    ("ASR_API_BASE", "asr.base_url"),
    ("ASR_MODEL", "asr.model"),
    ("ASR_SAMPLE_RATE", "asr.sample_rate"),
];

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__ASR__WS_URL=wss://example.com/v1`: Pin the socket base
    /// - `ASR_API_KEY=sk-...`: Provider credential for deployments
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                if !value.trim().is_empty() {
                    settings = settings.set_override(*key, value.trim().to_string())?;
                }
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.asr.model.trim().is_empty() {
            return Err(anyhow::anyhow!("ASR model must not be empty"));
        }

        if self.asr.sample_rate == 0 {
            return Err(anyhow::anyhow!("ASR sample rate must be greater than 0"));
        }

        if self.asr.stream_wait_cap_secs < self.asr.stream_wait_base_secs {
            return Err(anyhow::anyhow!(
                "ASR stream wait cap ({}s) must not be below the base wait ({}s)",
                self.asr.stream_wait_cap_secs,
                self.asr.stream_wait_base_secs
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }
}
