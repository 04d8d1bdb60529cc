//! Opérations concrètes: suppression, export, import

pub mod delete;
pub mod export;
pub mod import;

pub use delete::{DeleteCommand, DeleteItem, DeleteMode};
pub use export::{ExportCommand, FeatureFetcher};
pub use import::ImportCommand;

use serde::{Deserialize, Serialize};

use crate::session::Session;

/// Session de suppression / terminaison
pub type Deleter = Session<DeleteCommand>;
/// Session d'export
pub type Exporter = Session<ExportCommand>;
/// Session d'import
pub type Importer = Session<ImportCommand>;

/// Métadonnées de mise à jour écrites avec chaque feature modifiée
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub updating_person: Option<String>,
    pub reason_for_update: Option<String>,
    pub lineage: Option<String>,
}

/// Classe utilisée dans le journal quand elle n'est pas connue
pub const UNKNOWN_CLASS: &str = "unknown";
