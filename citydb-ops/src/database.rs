//! Interface avec la base de données
//!
//! Le moteur ne connaît la base qu'à travers [`DatabaseAdapter`] et
//! [`Connection`]. Les lots sont envoyés en colonnes sous forme de tableaux
//! (`unnest($1::bigint[], ...)`, `= ANY($1)`): un flush = une requête.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::DbError;

/// Nature d'une requête, pour les logs et les backends de test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    DeleteFeatures,
    TerminateFeatures,
    InsertFeatures,
    InsertProperties,
    FetchFeatures,
    ProbeObjectIds,
    ReserveIds,
    SelectIds,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DeleteFeatures => "delete_features",
            Self::TerminateFeatures => "terminate_features",
            Self::InsertFeatures => "insert_features",
            Self::InsertProperties => "insert_properties",
            Self::FetchFeatures => "fetch_features",
            Self::ProbeObjectIds => "probe_objectids",
            Self::ReserveIds => "reserve_ids",
            Self::SelectIds => "select_ids",
        };
        f.write_str(name)
    }
}

/// Requête SQL préparée par le moteur
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub kind: StatementKind,
    pub sql: String,
}

impl Statement {
    pub fn new(kind: StatementKind, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
        }
    }
}

/// Paramètre d'une requête
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    BigInt(i64),
    Text(String),
    BigIntArray(Vec<Option<i64>>),
    DoubleArray(Vec<Option<f64>>),
    TextArray(Vec<Option<String>>),
    JsonArray(Vec<Option<serde_json::Value>>),
}

/// Type d'une colonne de lot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Text,
    Json,
}

/// Valeur scalaire (ligne de lot ou résultat de requête)
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    BigInt(i64),
    Double(f64),
    Text(String),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::BigInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::BigInt(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Ligne de résultat
pub type Row = Vec<SqlValue>;

/// Connexion en commit manuel
///
/// Une transaction s'ouvre implicitement avec la première requête et se
/// termine par `commit` ou `rollback`. Implémentations partageables entre
/// threads: le moteur sérialise lui-même les frontières de transaction.
pub trait Connection: Send + Sync {
    /// Exécute une requête de modification, retourne le nombre de lignes
    fn execute(&self, statement: &Statement, params: &[SqlParam]) -> Result<u64, DbError>;

    /// Exécute une requête de lecture
    fn query(&self, statement: &Statement, params: &[SqlParam]) -> Result<Vec<Row>, DbError>;

    /// Valide la transaction en cours (sans effet s'il n'y en a pas)
    fn commit(&self) -> Result<(), DbError>;

    /// Annule la transaction en cours (sans effet s'il n'y en a pas)
    fn rollback(&self) -> Result<(), DbError>;
}

/// Adaptateur de base de données
pub trait DatabaseAdapter: Send + Sync {
    /// Ouvre une nouvelle connexion en commit manuel
    fn connect(&self) -> Result<Box<dyn Connection>, DbError>;

    /// Schéma contenant les tables `feature` et `property`
    fn schema(&self) -> &str;

    /// SRID des géométries stockées
    fn srid(&self) -> u32;

    /// Taille de lot maximale supportée
    fn max_batch_size(&self) -> usize {
        1000
    }

    /// Nombre maximal de valeurs dans un opérateur IN
    fn max_in_operator_size(&self) -> usize {
        1000
    }
}

/// Connexion de session
///
/// Une seule requête à la fois sur la connexion sous-jacente: requêtes,
/// `commit` et `rollback` prennent le même verrou exclusif, aucune requête
/// n'est donc en cours quand une frontière de transaction est franchie.
/// Une requête en échec marque la transaction: le commit suivant est
/// refusé, seul un rollback la libère.
pub struct SessionConnection {
    inner: Box<dyn Connection>,
    gate: Mutex<()>,
    failed: AtomicBool,
}

impl SessionConnection {
    pub fn new(inner: Box<dyn Connection>) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
            failed: AtomicBool::new(false),
        }
    }

    fn mark<T>(&self, result: Result<T, DbError>) -> Result<T, DbError> {
        if result.is_err() {
            self.failed.store(true, Ordering::SeqCst);
        }
        result
    }

    pub fn execute(&self, statement: &Statement, params: &[SqlParam]) -> Result<u64, DbError> {
        let _exclusive = self.gate.lock();
        self.mark(self.inner.execute(statement, params))
    }

    pub fn query(&self, statement: &Statement, params: &[SqlParam]) -> Result<Vec<Row>, DbError> {
        let _exclusive = self.gate.lock();
        self.mark(self.inner.query(statement, params))
    }

    /// Exécute puis appelle `on_success` sans relâcher le verrou
    ///
    /// Utilisé pour marquer les entrées de log comme "flushées" avant
    /// qu'un commit concurrent puisse passer.
    pub fn execute_then<F>(
        &self,
        statement: &Statement,
        params: &[SqlParam],
        on_success: F,
    ) -> Result<u64, DbError>
    where
        F: FnOnce(u64),
    {
        let _exclusive = self.gate.lock();
        let rows = self.mark(self.inner.execute(statement, params))?;
        on_success(rows);
        Ok(rows)
    }

    /// Variante lecture de [`execute_then`](Self::execute_then)
    pub fn query_then<F, T>(
        &self,
        statement: &Statement,
        params: &[SqlParam],
        on_success: F,
    ) -> Result<T, DbError>
    where
        F: FnOnce(Vec<Row>) -> T,
    {
        let _exclusive = self.gate.lock();
        let rows = self.mark(self.inner.query(statement, params))?;
        Ok(on_success(rows))
    }

    /// Une requête a échoué depuis le dernier commit/rollback
    pub fn has_failed_statement(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Commit exclusif; `on_commit` s'exécute sous le même verrou
    pub fn commit_with<F>(&self, on_commit: F) -> Result<(), DbError>
    where
        F: FnOnce(),
    {
        let _exclusive = self.gate.lock();
        if self.failed.load(Ordering::SeqCst) {
            return Err(DbError::new(
                "current transaction contains a failed statement, commit refused",
            ));
        }
        self.inner.commit()?;
        on_commit();
        Ok(())
    }

    /// Rollback exclusif; `on_rollback` s'exécute même si le rollback échoue
    pub fn rollback_with<F>(&self, on_rollback: F) -> Result<(), DbError>
    where
        F: FnOnce(),
    {
        let _exclusive = self.gate.lock();
        let result = self.inner.rollback();
        self.failed.store(false, Ordering::SeqCst);
        on_rollback();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryAdapter, MemoryDatabase};
    use std::sync::Arc;

    #[test]
    fn test_sql_value_accessors() {
        assert_eq!(SqlValue::from(42i64).as_i64(), Some(42));
        assert_eq!(SqlValue::from(42i64).as_f64(), Some(42.0));
        assert_eq!(SqlValue::from("abc").as_str(), Some("abc"));
        assert!(SqlValue::from(None::<String>).is_null());
        assert_eq!(SqlValue::from(Some(1.5)).as_f64(), Some(1.5));
    }

    #[test]
    fn test_statement_kind_display() {
        assert_eq!(StatementKind::ProbeObjectIds.to_string(), "probe_objectids");
        assert_eq!(StatementKind::DeleteFeatures.to_string(), "delete_features");
    }

    #[test]
    fn test_statements_never_overlap() {
        let db = Arc::new(MemoryDatabase::new());
        let ids: Vec<i64> = (0..64)
            .map(|i| db.insert_feature(&format!("f{}", i), "Building"))
            .collect();
        let adapter = MemoryAdapter::new(Arc::clone(&db));
        let connection = SessionConnection::new(adapter.connect().unwrap());
        let statement = Statement::new(
            StatementKind::DeleteFeatures,
            "DELETE FROM citydb.feature WHERE id = ANY($1::bigint[])",
        );

        std::thread::scope(|scope| {
            for chunk in ids.chunks(8) {
                let connection = &connection;
                let statement = &statement;
                scope.spawn(move || {
                    for id in chunk {
                        connection
                            .execute(statement, &[SqlParam::BigIntArray(vec![Some(*id)])])
                            .unwrap();
                    }
                });
            }
        });

        assert!(!db.saw_overlapping_statements());
        connection.commit_with(|| {}).unwrap();
        assert!(db.live_ids().is_empty());
    }
}
