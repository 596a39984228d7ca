//! Report and connection metadata.
//!
//! Reports pair a stored base query with the connection it runs on. The engine only reads this
//! metadata through [`ReportCatalog`]; [`StaticCatalog`] serves it from the configuration file.

use crate::api::models::pivot::MetricDefinition;
use crate::dialect::{ConnectionParams, Dialect};
use crate::errors::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// A saved report: the base query plus its pivot defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportDefinition {
    pub id: i64,
    pub name: String,
    pub connection_id: i64,
    /// Base query, used verbatim as a derived table
    pub query: String,
    #[serde(default)]
    pub default_group_by: Vec<String>,
    #[serde(default)]
    pub default_metrics: Vec<MetricDefinition>,
    /// Metrics offered to clients; margin metrics here supply fields that requests may omit
    #[serde(default)]
    pub available_metrics: Vec<MetricDefinition>,
    /// Display labels keyed by column name
    #[serde(default)]
    pub column_labels: BTreeMap<String, String>,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Overrides the raw query TTL for this report
    #[serde(default, with = "humantime_serde")]
    pub cache_ttl: Option<Duration>,
}

fn default_cache_enabled() -> bool {
    true
}

/// A database a report can run against.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionDefinition {
    pub id: i64,
    pub name: String,
    pub dialect: Dialect,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// AES-256-GCM ciphertext (base64 of nonce and ciphertext); needs `encryption_key`
    #[serde(default)]
    pub password_encrypted: Option<String>,
}

impl ConnectionDefinition {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.dialect.default_port())
    }

    /// Connection parameters with the password already resolved.
    pub fn params<'a>(&'a self, password: &'a str) -> ConnectionParams<'a> {
        ConnectionParams {
            host: &self.host,
            port: self.port,
            database: &self.database,
            username: &self.username,
            password,
        }
    }
}

// Hand-written so passwords never reach logs
impl fmt::Debug for ConnectionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dialect", &self.dialect)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Read access to report metadata.
#[async_trait]
pub trait ReportCatalog: Send + Sync {
    /// Look up a report; unknown ids are [`Error::NotFound`].
    async fn report(&self, id: i64) -> Result<ReportDefinition>;

    /// Look up a connection; unknown ids are [`Error::NotFound`].
    async fn connection(&self, id: i64) -> Result<ConnectionDefinition>;

    /// Every configured connection, in id order.
    async fn connections(&self) -> Result<Vec<ConnectionDefinition>>;
}

/// Catalog held in memory, built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    reports: HashMap<i64, ReportDefinition>,
    connections: BTreeMap<i64, ConnectionDefinition>,
}

impl StaticCatalog {
    pub fn new(connections: Vec<ConnectionDefinition>, reports: Vec<ReportDefinition>) -> Self {
        Self {
            reports: reports.into_iter().map(|r| (r.id, r)).collect(),
            connections: connections.into_iter().map(|c| (c.id, c)).collect(),
        }
    }
}

#[async_trait]
impl ReportCatalog for StaticCatalog {
    async fn report(&self, id: i64) -> Result<ReportDefinition> {
        self.reports.get(&id).cloned().ok_or_else(|| Error::report_not_found(id))
    }

    async fn connection(&self, id: i64) -> Result<ConnectionDefinition> {
        self.connections
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::connection_not_found(id))
    }

    async fn connections(&self) -> Result<Vec<ConnectionDefinition>> {
        Ok(self.connections.values().cloned().collect())
    }
}
