use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Crate-level settings, loaded from `PGLEASE_*` environment variables
/// on top of serialized defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Table holding the lock rows; its companion sequence is named
    /// `<table_name>_rvn`.
    pub table_name: String,
    /// How long a single record version number stays valid without a
    /// refresh, in milliseconds. Doubles as the per-transaction deadline.
    pub lease_duration_ms: u64,
    /// Interval between lease refreshes, in milliseconds. Zero disables
    /// the background heartbeat.
    pub heartbeat_frequency_ms: u64,
    /// Maximum number of pooled database connections.
    pub pool_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            table_name: "locks".to_string(),
            lease_duration_ms: 20_000,
            heartbeat_frequency_ms: 5_000,
            pool_size: 4,
        }
    }
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("PGLEASE"))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: Settings = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        Ok(cfg)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }
}

/// PostgreSQL connection configuration, assembled from the standard
/// `PG*` environment variables.
#[derive(Clone)]
pub struct PgConfig {
    connection_string: String,
    ssl_mode: PgSslMode,
}

#[derive(Clone, Copy, Debug)]
pub enum PgSslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl PgSslMode {
    pub fn from_env() -> Self {
        let value = std::env::var("PGSSLMODE").unwrap_or_else(|_| "disable".to_string());
        Self::from_str(value.as_str())
    }

    pub fn from_str(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            "verify-ca" => Self::VerifyCa,
            "verify-full" => Self::VerifyFull,
            _ => Self::Disable,
        }
    }
}

impl PgConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let user = std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string());
        let dbname = std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".to_string());
        let password = std::env::var("PGPASSWORD").ok();

        let mut config = format!("host={host} port={port} user={user} dbname={dbname}");
        if let Some(pwd) = password {
            config.push_str(&format!(" password={pwd}"));
        }

        Self {
            connection_string: config,
            ssl_mode: PgSslMode::from_env(),
        }
    }

    pub fn new(connection_string: impl Into<String>, ssl_mode: PgSslMode) -> Self {
        Self {
            connection_string: connection_string.into(),
            ssl_mode,
        }
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn ssl_mode(&self) -> PgSslMode {
        self.ssl_mode
    }
}
