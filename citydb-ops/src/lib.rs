//! # citydb-ops
//!
//! Moteur d'opérations en masse pour bases de modèles urbains 3D
//! (schéma `feature` / `property`).
//!
//! ## Fonctionnalités
//!
//! - Sessions concurrentes de suppression, terminaison, export et import
//! - Écriture par lots par worker, une requête par flush
//! - Politiques transactionnelles: commit final, commits intermédiaires, aperçu
//! - Détection des doublons avant import avec cache mémoire ou disque
//!
//! ## Exemple
//!
//! ```ignore
//! use citydb_ops::{DeleteCommand, Deleter, SessionOptions};
//!
//! let deleter = Deleter::new(DeleteCommand::default());
//! deleter.start(&adapter, SessionOptions::default())?;
//! for id in ids {
//!     deleter.submit(id.into());
//! }
//! deleter.commit_session()?;
//! ```

pub mod batch;
pub mod context;
pub mod cursor;
pub mod database;
pub mod duplicate;
pub mod error;
pub mod feature;
pub mod latch;
pub mod log;
pub mod operation;
pub mod pool;
pub mod session;
pub mod statistics;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use batch::{BatchRow, BatchWriter, TableKind};
pub use context::{WorkerContext, WriterEnv, WriterFactory};
pub use cursor::{FeatureRef, IdCursor};
pub use database::{Connection, DatabaseAdapter, Row, SqlParam, SqlValue, Statement, StatementKind};
pub use duplicate::{
    CacheBackend, DuplicateController, DuplicateCounts, DuplicateMode, DuplicateOptions, FileDecision,
};
pub use error::{CacheError, DbError, OpsError, Result};
pub use feature::{AttributeValue, CityFeature, Envelope, ExportedFeature, FeatureSink, TypeFilter};
pub use latch::CountLatch;
pub use log::{write_entries_csv, LogEntry, OperationLog};
pub use operation::{
    DeleteCommand, DeleteItem, DeleteMode, Deleter, ExportCommand, Exporter, ImportCommand, Importer,
    Metadata,
};
pub use session::{Command, Completion, Session, SessionOptions, SessionState, TransactionMode};
pub use statistics::Statistics;
