//! Détection des doublons avant import

pub mod cache;
pub mod controller;
pub mod deleter;
pub mod finder;

pub use cache::{CacheBackend, DiskStore, IdentityCache, KeyValueStore, MemoryStore};
pub use controller::DuplicateController;
pub use deleter::DuplicateDeleter;
pub use finder::DuplicateFinder;

use serde::Serialize;

use crate::operation::Metadata;

/// Traitement des features déjà présentes en base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMode {
    /// Ignorer le fichier si toutes ses features existent déjà
    #[default]
    SkipExisting,
    /// Supprimer les features existantes puis importer
    DeleteExisting,
    /// Terminer les features existantes puis importer
    TerminateExisting,
}

/// Décision pour un fichier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDecision {
    AcceptFile,
    SkipFile,
}

/// Options du contrôleur de doublons
#[derive(Debug, Clone, Default)]
pub struct DuplicateOptions {
    pub mode: DuplicateMode,
    pub backend: CacheBackend,
    /// Suppression/terminaison annulée en fin de passage
    pub preview: bool,
    pub threads: Option<usize>,
    pub batch_size: Option<usize>,
    pub metadata: Metadata,
}

/// Compteurs d'un passage de détection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateCounts {
    /// Features retenues par le filtre de type
    pub features: u64,
    /// Objectids distincts
    pub distinct: u64,
    /// Occurrences répétées d'un objectid dans le fichier
    pub in_file: u64,
    /// Occurrences dont l'objectid existe en base
    pub in_database: u64,
    /// Objectids distincts existant en base
    pub distinct_in_database: u64,
    /// Features retirées de la base
    pub removed: u64,
    /// Features qui auraient été retirées (aperçu)
    pub removal_previewed: u64,
}
