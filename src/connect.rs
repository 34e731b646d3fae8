use anyhow::{bail, Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{NoTls, Socket};
use tracing::{debug, warn};

use crate::config::{PgConfig, PgSslMode};

enum TlsConfig {
    None,
    Prefer(MakeTlsConnector),
    Enforced(MakeTlsConnector),
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsConfig::None => write!(f, "TlsConfig::None"),
            TlsConfig::Prefer(_) => write!(f, "TlsConfig::Prefer(..)"),
            TlsConfig::Enforced(_) => write!(f, "TlsConfig::Enforced(..)"),
        }
    }
}

fn build_tls_connector(mode: PgSslMode) -> Result<MakeTlsConnector> {
    match mode {
        PgSslMode::Prefer | PgSslMode::Require => {
            let connector = TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .context("failed to build TLS connector for PGSSLMODE=require")?;
            Ok(MakeTlsConnector::new(connector))
        }
        PgSslMode::VerifyCa => {
            let connector = TlsConnector::builder()
                .danger_accept_invalid_hostnames(true)
                .build()
                .context("failed to build TLS connector for PGSSLMODE=verify-ca")?;
            Ok(MakeTlsConnector::new(connector))
        }
        PgSslMode::VerifyFull => {
            let connector = TlsConnector::builder()
                .build()
                .context("failed to build TLS connector for PGSSLMODE=verify-full")?;
            Ok(MakeTlsConnector::new(connector))
        }
        PgSslMode::Disable => {
            bail!("PGSSLMODE=disable should not attempt to build a TLS connector")
        }
    }
}

fn build_tls_config(mode: PgSslMode) -> Result<TlsConfig> {
    match mode {
        PgSslMode::Disable => Ok(TlsConfig::None),
        PgSslMode::Prefer => Ok(TlsConfig::Prefer(build_tls_connector(mode)?)),
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => {
            Ok(TlsConfig::Enforced(build_tls_connector(mode)?))
        }
    }
}

fn build_pool<T>(pg_config: tokio_postgres::Config, tls: T, max_size: usize) -> Result<Pool>
where
    T: MakeTlsConnect<Socket> + Clone + Sync + Send + 'static,
    T::Stream: Sync + Send,
    T::TlsConnect: Sync + Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let manager = Manager::from_config(
        pg_config,
        tls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .context("failed to build connection pool")
}

async fn probe_tls(pg_config: &tokio_postgres::Config, connector: MakeTlsConnector) -> Result<()> {
    let (client, connection) = pg_config.connect(connector).await?;
    drop(connection);
    drop(client);
    Ok(())
}

/// Builds a connection pool for the given configuration, honoring the
/// five `PGSSLMODE` behaviors. In `prefer` mode a single TLS probe
/// decides whether the pool uses TLS or falls back to plaintext.
pub async fn create_pool(config: &PgConfig, max_size: usize) -> Result<Pool> {
    let pg_config: tokio_postgres::Config = config
        .connection_string()
        .parse()
        .context("failed to parse PostgreSQL connection string")?;
    let tls_config = build_tls_config(config.ssl_mode())?;

    match tls_config {
        TlsConfig::None => {
            debug!("connecting to PostgreSQL without TLS");
            build_pool(pg_config, NoTls, max_size)
        }
        TlsConfig::Prefer(connector) => {
            debug!(
                "connecting to PostgreSQL with TLS mode {:?}",
                config.ssl_mode()
            );
            match probe_tls(&pg_config, connector.clone()).await {
                Ok(()) => build_pool(pg_config, connector, max_size),
                Err(err) => {
                    warn!(
                        error = %err,
                        "TLS connection failed in PGSSLMODE=prefer, retrying without TLS"
                    );
                    debug!("connecting to PostgreSQL without TLS (prefer fallback)");
                    build_pool(pg_config, NoTls, max_size)
                }
            }
        }
        TlsConfig::Enforced(connector) => {
            debug!(
                "connecting to PostgreSQL with TLS mode {:?}",
                config.ssl_mode()
            );
            build_pool(pg_config, connector, max_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_connector_building_per_mode() {
        assert!(matches!(
            build_tls_config(PgSslMode::Disable).expect("disable mode config should not error"),
            TlsConfig::None
        ));
        assert!(matches!(
            build_tls_config(PgSslMode::Prefer).expect("prefer mode config should not error"),
            TlsConfig::Prefer(_)
        ));
        for mode in [PgSslMode::Require, PgSslMode::VerifyCa, PgSslMode::VerifyFull] {
            match build_tls_config(mode)
                .unwrap_or_else(|e| panic!("failed to build TLS config for {:?}: {}", mode, e))
            {
                TlsConfig::Enforced(_) => {}
                other => panic!("mode {:?} expected Enforced, got {:?}", mode, other),
            }
        }
    }
}
