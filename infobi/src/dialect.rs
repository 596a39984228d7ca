//! SQL dialect adapter.
//!
//! Everything that differs between the supported backends lives here: identifier quoting, bound
//! parameter markers, pagination and row limiting syntax, default ports and connection string
//! templates. Query compilers stay dialect-agnostic and ask the [`Dialect`] for rendering only,
//! so switching backends never changes which columns are selected, grouped, filtered or ordered.

use crate::errors::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use url::Url;

/// A supported SQL backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    MsSql,
    Postgres,
    MySql,
}

/// Connection parameters used to build a backend connection string.
#[derive(Debug, Clone)]
pub struct ConnectionParams<'a> {
    pub host: &'a str,
    pub port: Option<u16>,
    pub database: &'a str,
    pub username: &'a str,
    pub password: &'a str,
}

impl Dialect {
    /// The canonical tag, as written in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::MsSql => "mssql",
            Dialect::Postgres => "postgresql",
            Dialect::MySql => "mysql",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Dialect::MsSql => 1433,
            Dialect::Postgres => 5432,
            Dialect::MySql => 3306,
        }
    }

    /// Quote an identifier, doubling any embedded closing quote character.
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            Dialect::MsSql => format!("[{}]", name.replace(']', "]]")),
            Dialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
            Dialect::MySql => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// Bound parameter marker for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::MsSql => format!("@P{index}"),
            Dialect::Postgres => format!("${index}"),
            Dialect::MySql => "?".to_string(),
        }
    }

    /// SQL Server only accepts `OFFSET .. FETCH` after an `ORDER BY`.
    pub fn pagination_requires_order(&self) -> bool {
        matches!(self, Dialect::MsSql)
    }

    /// Trailing pagination clause selecting `limit` rows after skipping `offset`.
    pub fn pagination(&self, limit: u64, offset: u64) -> String {
        match self {
            Dialect::MsSql => format!("OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY"),
            Dialect::Postgres | Dialect::MySql => format!("LIMIT {limit} OFFSET {offset}"),
        }
    }

    /// Wrap `sql` so that at most `limit` rows come back.
    pub fn limit_rows(&self, sql: &str, limit: u64) -> String {
        match self {
            Dialect::MsSql => format!("SELECT TOP {limit} * FROM ({sql}) AS limited_data"),
            Dialect::Postgres | Dialect::MySql => format!("SELECT * FROM ({sql}) AS limited_data LIMIT {limit}"),
        }
    }

    /// Cheapest statement that proves a connection is usable.
    pub fn probe_sql(&self) -> &'static str {
        "SELECT 1"
    }

    /// Build the backend connection string for `params`.
    ///
    /// Username and password are percent-encoded; a missing port falls back to the dialect default.
    pub fn connection_string(&self, params: &ConnectionParams<'_>) -> Result<String, ConfigError> {
        let scheme = match self {
            Dialect::MsSql => "mssql",
            Dialect::Postgres => "postgresql",
            Dialect::MySql => "mysql",
        };
        let port = params.port.unwrap_or_else(|| self.default_port());

        let mut url = Url::parse(&format!("{scheme}://{}:{port}/", params.host))
            .map_err(|e| ConfigError::invalid(format!("Invalid host '{}': {e}", params.host)))?;
        url.set_path(params.database);
        url.set_username(params.username)
            .map_err(|_| ConfigError::invalid("Connection username cannot be set on this host"))?;
        url.set_password(Some(params.password))
            .map_err(|_| ConfigError::invalid("Connection password cannot be set on this host"))?;
        if matches!(self, Dialect::MsSql) {
            url.set_query(Some("TrustServerCertificate=true"));
        }

        Ok(url.to_string())
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mssql" | "sqlserver" => Ok(Dialect::MsSql),
            "postgresql" | "postgres" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            _ => Err(ConfigError::UnsupportedDialect { dialect: s.to_string() }),
        }
    }
}

impl Serialize for Dialect {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Dialect {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}
