//! Types d'erreurs pour le crate citydb-ops

use std::fmt;

use thiserror::Error;

use crate::batch::TableKind;
use crate::session::SessionState;

/// Erreur remontée par un adaptateur de base de données
///
/// Clonable: la même erreur est à la fois conservée comme premier échec
/// de la session et transmise au handle de l'élément fautif.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    /// Message de l'adaptateur
    pub message: String,
    /// Code SQLSTATE (si disponible)
    pub sqlstate: Option<String>,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
        }
    }

    pub fn with_sqlstate(message: impl Into<String>, sqlstate: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: Some(sqlstate.into()),
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DbError {}

/// Erreurs du cache d'identités
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Erreur d'I/O sur le répertoire du cache
    #[error("cache I/O error: {0}")]
    Io(String),

    /// Erreur du moteur de stockage
    #[error("cache storage error: {0}")]
    Storage(String),

    /// Valeur stockée illisible
    #[error("corrupted cache entry for key {key}")]
    Corrupted { key: String },

    /// Cache déjà fermé
    #[error("cache is closed")]
    Closed,
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<fjall::Error> for CacheError {
    fn from(e: fjall::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Erreurs pouvant survenir pendant une opération en masse
#[derive(Debug, Clone, Error)]
pub enum OpsError {
    /// Erreur de la base de données
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// Erreur du cache d'identités
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Soumission refusée: la session n'est pas démarrée ou est terminée
    #[error("session is {0}, work submission is not allowed")]
    NotAllowed(SessionState),

    /// Session jamais démarrée
    #[error("session has not been started")]
    NotStarted,

    /// Session déjà terminée (commit ou abort)
    #[error("session is already {0}")]
    AlreadyFinished(SessionState),

    /// Travail annulé après un échec antérieur
    #[error("work cancelled after a previous failure")]
    Cancelled,

    /// Le pool de workers n'a pas pu démarrer ou est fermé
    #[error("worker pool error: {0}")]
    Pool(String),

    /// Un worker a paniqué pendant l'exécution d'un élément
    #[error("worker panicked: {0}")]
    Panicked(String),

    /// Décrément du latch sous zéro
    #[error("count latch decremented below zero")]
    LatchUnderflow,

    /// Aucun writer de ce type pour l'opération en cours
    #[error("no {0} writer is available for this operation")]
    UnsupportedTable(TableKind),

    /// Ligne de lot incompatible avec le gabarit de la table
    #[error("invalid row for {table}: {reason}")]
    InvalidRow { table: TableKind, reason: String },

    /// Feature invalide
    #[error("invalid feature {id}: {reason}")]
    InvalidFeature { id: String, reason: String },

    /// Erreur du lecteur de features
    #[error("reader error: {0}")]
    Reader(String),

    /// Erreur de la destination d'export
    #[error("sink error: {0}")]
    Sink(String),

    /// Résultat abandonné sans être produit
    #[error("work item outcome was dropped before completion")]
    Dropped,
}

impl OpsError {
    /// Crée une erreur de feature invalide
    pub fn invalid_feature(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFeature {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = OpsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_display() {
        assert_eq!(DbError::new("boom").to_string(), "boom");
        assert_eq!(
            DbError::with_sqlstate("duplicate key", "23505").to_string(),
            "duplicate key (SQLSTATE 23505)"
        );
    }

    #[test]
    fn test_ops_error_from_db() {
        let err: OpsError = DbError::new("connection lost").into();
        assert!(matches!(err, OpsError::Database(_)));
        assert_eq!(err.to_string(), "database error: connection lost");
    }

    #[test]
    fn test_not_allowed_mentions_state() {
        let err = OpsError::NotAllowed(SessionState::Committed);
        assert!(err.to_string().contains("committed"));
    }
}
