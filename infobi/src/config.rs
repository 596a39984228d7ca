//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `INFOBI_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `INFOBI_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `INFOBI_CACHE__PIVOT_TTL=10m` sets `cache.pivot_ttl`.
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port`, `cors`
//! - **Features**: `enable_metrics`, `enable_otel_export`
//! - **Cache**: `cache.enabled`, `cache.query_ttl`, `cache.pivot_ttl`, `cache.max_capacity_mb`
//! - **Engine**: `engine.query_timeout`, `engine.validate_identifiers`, `engine.warmup_on_start`, ...
//! - **Catalog**: `connections` and `reports`, the databases and saved queries served
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! INFOBI_PORT=8080
//! INFOBI_ENABLE_METRICS=true
//! INFOBI_ENGINE__QUERY_TIMEOUT=2m
//! INFOBI_ENCRYPTION_KEY=<base64 of 32 bytes>
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use crate::catalog::{ConnectionDefinition, ReportDefinition};
use crate::errors::Error;
use crate::execution::pool::PoolSettings;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "INFOBI_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty file yields a server with no reports.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
    /// Base64 AES-256 key for `password_encrypted` connection fields.
    /// Falls back to the `INFOBI_ENCRYPTION_KEY` environment variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// CORS configuration for browser clients
    pub cors: CorsConfig,
    /// Result cache settings
    pub cache: CacheConfig,
    /// Query execution settings
    pub engine: EngineConfig,
    /// Databases reports can run against
    pub connections: Vec<ConnectionDefinition>,
    /// Saved reports
    pub reports: Vec<ReportDefinition>,
}

/// CORS (Cross-Origin Resource Sharing) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            max_age: None,
        }
    }
}

/// Allowed CORS origin.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

/// Result cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Disable to execute every request against the backend
    pub enabled: bool,
    /// First segment of every cache key; must not contain `:`
    pub namespace: String,
    /// TTL for raw report data (a report's `cache_ttl` overrides it)
    #[serde(with = "humantime_serde")]
    pub query_ttl: Duration,
    /// TTL for pivot results
    #[serde(with = "humantime_serde")]
    pub pivot_ttl: Duration,
    /// Upper bound on cached payload bytes, in megabytes
    pub max_capacity_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "infobi".to_string(),
            query_ttl: Duration::from_secs(3600),
            pivot_ttl: Duration::from_secs(300),
            max_capacity_mb: 512,
        }
    }
}

/// Query execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on a whole request, enforced by the HTTP layer
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Largest grid page served in one request; larger windows are truncated
    pub max_rows_preview: u64,
    /// Maximum pooled connections per PostgreSQL/MySQL connection
    pub pool_max_connections: u32,
    /// How long to wait for a pooled connection (and the TDS connect timeout)
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Reject request columns that are not in the report's result schema
    pub validate_identifiers: bool,
    /// Probe every connection in the background at startup
    pub warmup_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(300),
            max_rows_preview: 1000,
            pool_max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            validate_identifiers: false,
            warmup_on_start: true,
        }
    }
}

impl EngineConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.pool_max_connections,
            acquire_timeout: self.acquire_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            enable_metrics: false,
            enable_otel_export: false,
            encryption_key: None,
            cors: CorsConfig::default(),
            cache: CacheConfig::default(),
            engine: EngineConfig::default(),
            connections: Vec::new(),
            reports: Vec::new(),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    fn invalid(message: impl Into<String>) -> Error {
        Error::Internal {
            operation: format!("Config validation: {}", message.into()),
        }
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.cache.query_ttl.is_zero() || self.cache.pivot_ttl.is_zero() {
            return Err(Self::invalid("cache TTLs must be greater than 0"));
        }
        if self.cache.namespace.is_empty() || self.cache.namespace.contains(':') {
            return Err(Self::invalid("cache.namespace must be non-empty and must not contain ':'"));
        }
        if self.engine.query_timeout.is_zero() {
            return Err(Self::invalid("engine.query_timeout must be greater than 0"));
        }
        if self.engine.max_rows_preview == 0 {
            return Err(Self::invalid("engine.max_rows_preview must be greater than 0"));
        }
        if self.engine.pool_max_connections == 0 {
            return Err(Self::invalid("engine.pool_max_connections must be greater than 0"));
        }

        let mut connection_ids = HashSet::new();
        for connection in &self.connections {
            if !connection_ids.insert(connection.id) {
                return Err(Self::invalid(format!("duplicate connection id {}", connection.id)));
            }
            if connection.password_encrypted.is_some()
                && crate::crypto::resolve_key(self.encryption_key.as_deref()).is_none()
            {
                return Err(Self::invalid(format!(
                    "connection {} has password_encrypted but no encryption_key is configured",
                    connection.id
                )));
            }
        }

        let mut report_ids = HashSet::new();
        for report in &self.reports {
            if !report_ids.insert(report.id) {
                return Err(Self::invalid(format!("duplicate report id {}", report.id)));
            }
            if !connection_ids.contains(&report.connection_id) {
                return Err(Self::invalid(format!(
                    "report {} references unknown connection {}",
                    report.id, report.connection_id
                )));
            }
            if report.query.trim().is_empty() {
                return Err(Self::invalid(format!("report {} has an empty query", report.id)));
            }
            if report.cache_ttl.is_some_and(|ttl| ttl.is_zero()) {
                return Err(Self::invalid(format!("report {} cache_ttl must be greater than 0", report.id)));
            }
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("INFOBI_").split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
