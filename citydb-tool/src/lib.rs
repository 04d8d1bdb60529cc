//! # citydb-tool
//!
//! Outil en ligne de commande pour le moteur `citydb-ops` sur PostgreSQL/PostGIS.
//!
//! ## Features
//!
//! - Import de fichiers CityJSON Sequence (un fichier = une transaction)
//! - Détection des doublons avant import (ignorer, supprimer, terminer)
//! - Export CityJSON Sequence par classe, id ou objectid
//! - Suppression ou terminaison en masse avec journal CSV
//! - Rapport JSON de chaque commande
//!
//! ## Usage CLI
//!
//! ```bash
//! # Import d'un répertoire, doublons ignorés
//! citydb import --path ./tiles/ --duplicates skip
//!
//! # Export des bâtiments
//! citydb export --output buildings.jsonl --type-name Building
//!
//! # Terminaison en aperçu
//! citydb delete --objectid BLDG_42 --mode terminate --preview
//! ```

pub mod adapter;
pub mod cli;
pub mod config;
pub mod io;
pub mod report;

pub use adapter::{create_pool, DatabaseConfig, PostgresAdapter};
pub use config::Config;
pub use io::{CityJsonSeqReader, CityJsonSeqWriter};
pub use report::{OperationReport, OperationStatus};
