//! Configuration du système
//!
//! Fichier JSON optionnel (`--config`). Priorité: options CLI, puis
//! fichier, puis variables d'environnement.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration principale
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseSection,
    pub session: SessionSection,
    pub import: ImportSection,
}

/// Connexion (surcharge de `PGHOST`, `PGPORT`, ...)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// disable, prefer, require
    pub ssl: Option<String>,
    pub schema: Option<String>,
    pub pool_size: Option<usize>,
}

impl DatabaseSection {
    /// Complète les valeurs absentes avec celles de `fallback`
    pub fn or(self, fallback: &DatabaseSection) -> Self {
        Self {
            host: self.host.or_else(|| fallback.host.clone()),
            port: self.port.or(fallback.port),
            database: self.database.or_else(|| fallback.database.clone()),
            user: self.user.or_else(|| fallback.user.clone()),
            password: self.password.or_else(|| fallback.password.clone()),
            ssl: self.ssl.or_else(|| fallback.ssl.clone()),
            schema: self.schema.or_else(|| fallback.schema.clone()),
            pool_size: self.pool_size.or(fallback.pool_size),
        }
    }
}

/// Paramètres par défaut des sessions
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub threads: Option<usize>,
    pub batch_size: Option<usize>,
    /// Commit intermédiaire tous les N éléments
    pub commit_every: Option<u64>,
}

/// Paramètres par défaut de l'import
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportSection {
    /// none, skip, delete, terminate
    pub duplicates: Option<String>,
    /// memory, disk
    pub cache: Option<String>,
    /// Répertoire du cache disque
    pub temp_dir: Option<PathBuf>,
    pub srid: Option<u32>,
}

impl Config {
    /// Charge une configuration depuis un fichier
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content).context("Failed to parse config JSON")
    }

    /// Configuration du fichier si fourni, vide sinon
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
