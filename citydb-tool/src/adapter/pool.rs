//! Pool de connexions PostgreSQL
//!
//! Une session du moteur garde sa connexion jusqu'à la fin: la taille du pool
//! borne le nombre de sessions simultanées (import, curseur, doublons).

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use deadpool_postgres::{Config, Pool, PoolConfig, Runtime, Timeouts};
use tokio_postgres::NoTls;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::debug;

use crate::config::DatabaseSection;

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const CREATE_TIMEOUT: Duration = Duration::from_secs(10);
const RECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Mode SSL (`PGSSLMODE`, `--ssl`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}

impl SslMode {
    fn uses_tls(self) -> bool {
        !matches!(self, Self::Disable)
    }
}

impl FromStr for SslMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mode = match value.trim().to_ascii_lowercase().as_str() {
            "disable" | "off" | "false" | "no" => Self::Disable,
            "prefer" => Self::Prefer,
            "require" | "on" | "true" | "yes" => Self::Require,
            other => return Err(format!("Invalid SSL mode '{}' (disable, prefer, require)", other)),
        };
        Ok(mode)
    }
}

/// Paramètres de connexion résolus
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub pool_size: usize,
    pub ssl_mode: SslMode,
    /// Schéma des tables `feature` / `property`
    pub schema: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            dbname: "citydb".into(),
            user: "postgres".into(),
            password: None,
            pool_size: 16,
            ssl_mode: SslMode::Disable,
            schema: "citydb".into(),
        }
    }
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

impl DatabaseConfig {
    /// Valeurs par défaut surchargées par `PG*`, `POOL_SIZE` et `CITYDB_SCHEMA`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply(&DatabaseSection {
            host: std::env::var("PGHOST").ok(),
            port: env_parsed("PGPORT"),
            database: std::env::var("PGDATABASE").ok(),
            user: std::env::var("PGUSER").ok(),
            password: std::env::var("PGPASSWORD").ok(),
            ssl: std::env::var("PGSSLMODE").ok(),
            schema: std::env::var("CITYDB_SCHEMA").ok(),
            pool_size: env_parsed("POOL_SIZE"),
        });
        config
    }

    /// Applique les valeurs renseignées; un mode SSL invalide est ignoré
    pub fn apply(&mut self, overrides: &DatabaseSection) {
        let section = overrides.clone();
        self.host = section.host.unwrap_or(std::mem::take(&mut self.host));
        self.port = section.port.unwrap_or(self.port);
        self.dbname = section.database.unwrap_or(std::mem::take(&mut self.dbname));
        self.user = section.user.unwrap_or(std::mem::take(&mut self.user));
        self.password = section.password.or(self.password.take());
        self.schema = section.schema.unwrap_or(std::mem::take(&mut self.schema));
        self.pool_size = section.pool_size.unwrap_or(self.pool_size);
        if let Some(mode) = section.ssl.and_then(|ssl| ssl.parse().ok()) {
            self.ssl_mode = mode;
        }
    }

    fn pg_config(&self) -> Config {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = self.password.clone();
        cfg.pool = Some(PoolConfig {
            max_size: self.pool_size,
            timeouts: Timeouts {
                wait: Some(WAIT_TIMEOUT),
                create: Some(CREATE_TIMEOUT),
                recycle: Some(RECYCLE_TIMEOUT),
            },
            ..Default::default()
        });
        cfg
    }
}

/// Connecteur rustls sur les racines webpki
fn tls_connector() -> MakeRustlsConnect {
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    MakeRustlsConnect::new(tls)
}

/// Crée le pool (aucune connexion n'est ouverte ici)
pub async fn create_pool(config: &DatabaseConfig) -> Result<Pool> {
    let cfg = config.pg_config();
    debug!(pool_size = config.pool_size, ssl = ?config.ssl_mode, "Creating connection pool");

    if config.ssl_mode.uses_tls() {
        cfg.create_pool(Some(Runtime::Tokio1), tls_connector())
            .context("Failed to create database pool with TLS")
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .context("Failed to create database pool")
    }
}

/// Ouvre une connexion et vérifie que le serveur répond
pub async fn test_connection(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("Failed to get connection from pool")?;
    let row = client
        .query_one("SELECT version()", &[])
        .await
        .context("Connection test failed")?;
    let version: String = row.get(0);
    debug!(server = %version, "Connection OK");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!(" PREFER ".parse::<SslMode>().unwrap(), SslMode::Prefer);
        assert_eq!("on".parse::<SslMode>().unwrap(), SslMode::Require);
        assert!("verify-full".parse::<SslMode>().is_err());
        assert!(SslMode::Prefer.uses_tls());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = DatabaseConfig::default();
        config.apply(&DatabaseSection {
            host: Some("db.internal".into()),
            port: Some(5433),
            ssl: Some("require".into()),
            schema: Some("lod2".into()),
            ..Default::default()
        });
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5433);
        assert_eq!(config.ssl_mode, SslMode::Require);
        assert_eq!(config.schema, "lod2");
        assert_eq!(config.user, "postgres");
        assert_eq!(config.dbname, "citydb");
    }

    #[test]
    fn test_invalid_ssl_override_is_ignored() {
        let mut config = DatabaseConfig::default();
        config.apply(&DatabaseSection {
            ssl: Some("sometimes".into()),
            ..Default::default()
        });
        assert_eq!(config.ssl_mode, SslMode::Disable);
    }

    #[test]
    fn test_pool_settings() {
        let config = DatabaseConfig {
            pool_size: 4,
            password: Some("secret".into()),
            ..Default::default()
        };
        let cfg = config.pg_config();
        assert_eq!(cfg.pool.map(|p| p.max_size), Some(4));
        assert_eq!(cfg.password.as_deref(), Some("secret"));
        assert_eq!(cfg.dbname.as_deref(), Some("citydb"));
    }
}
