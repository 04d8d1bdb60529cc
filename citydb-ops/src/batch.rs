//! Writers par lot
//!
//! Un writer accumule les lignes d'une table et exécute une requête unique
//! quand le seuil est atteint. Le flush a toujours lieu dans le thread du
//! worker qui a ajouté la ligne; seul le commit final flushe les writers de
//! tous les workers.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::database::{ColumnType, SessionConnection, SqlParam, SqlValue, Statement};
use crate::error::{OpsError, Result};
use crate::log::{LogRecord, OperationLog};

/// Type de writer (une table cible et une opération)
///
/// L'ordre des variantes est l'ordre de flush à la finalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    FeatureInsert,
    PropertyInsert,
    FeatureTerminate,
    FeatureDelete,
    FeatureFetch,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FeatureInsert => "feature-inserter",
            Self::PropertyInsert => "property-inserter",
            Self::FeatureTerminate => "feature-terminator",
            Self::FeatureDelete => "feature-deleter",
            Self::FeatureFetch => "feature-fetcher",
        };
        f.write_str(name)
    }
}

/// Ligne à ajouter à un lot
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub values: Vec<SqlValue>,
    /// Entrée de journal finalisée au flush
    pub log: Option<LogRecord>,
}

impl BatchRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values, log: None }
    }

    pub fn logged(values: Vec<SqlValue>, log: LogRecord) -> Self {
        Self {
            values,
            log: Some(log),
        }
    }
}

/// Writer d'une table
pub trait BatchWriter: Send {
    fn kind(&self) -> TableKind;

    /// Ajoute une ligne; flushe si le seuil est atteint
    fn add(&mut self, row: BatchRow) -> Result<()>;

    /// Lignes en attente
    fn pending(&self) -> usize;

    /// Seuil de flush automatique
    fn threshold(&self) -> usize;

    /// Exécute et vide le lot, quel que soit le seuil
    ///
    /// Le lot est vide au retour, même en cas d'erreur.
    fn force_flush(&mut self) -> Result<u64>;

    /// Abandonne les lignes en attente sans les exécuter
    fn discard(&mut self) -> usize;
}

/// Gabarit de requête d'un lot: une colonne de tableau par paramètre
#[derive(Debug, Clone)]
pub struct BatchTemplate {
    pub kind: TableKind,
    pub statement: Statement,
    pub columns: Vec<ColumnType>,
}

#[derive(Debug)]
enum ColumnBuffer {
    BigInt(Vec<Option<i64>>),
    Double(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
    Json(Vec<Option<serde_json::Value>>),
}

impl ColumnBuffer {
    fn new(column_type: ColumnType, capacity: usize) -> Self {
        match column_type {
            ColumnType::BigInt => Self::BigInt(Vec::with_capacity(capacity)),
            ColumnType::Double => Self::Double(Vec::with_capacity(capacity)),
            ColumnType::Text => Self::Text(Vec::with_capacity(capacity)),
            ColumnType::Json => Self::Json(Vec::with_capacity(capacity)),
        }
    }

    /// Vérifie qu'une valeur est acceptable sans la pousser
    fn accepts(&self, value: &SqlValue) -> bool {
        matches!(
            (self, value),
            (_, SqlValue::Null)
                | (Self::BigInt(_), SqlValue::BigInt(_))
                | (Self::Double(_), SqlValue::Double(_) | SqlValue::BigInt(_))
                | (Self::Text(_), SqlValue::Text(_))
                | (Self::Json(_), SqlValue::Json(_))
        )
    }

    fn push(&mut self, value: SqlValue) {
        match (self, value) {
            (Self::BigInt(col), v) => col.push(v.as_i64()),
            (Self::Double(col), v) => col.push(v.as_f64()),
            (Self::Text(col), SqlValue::Text(v)) => col.push(Some(v)),
            (Self::Text(col), _) => col.push(None),
            (Self::Json(col), SqlValue::Json(v)) => col.push(Some(v)),
            (Self::Json(col), _) => col.push(None),
        }
    }

    fn take(&mut self) -> SqlParam {
        match self {
            Self::BigInt(col) => SqlParam::BigIntArray(std::mem::take(col)),
            Self::Double(col) => SqlParam::DoubleArray(std::mem::take(col)),
            Self::Text(col) => SqlParam::TextArray(std::mem::take(col)),
            Self::Json(col) => SqlParam::JsonArray(std::mem::take(col)),
        }
    }

    fn clear(&mut self) {
        match self {
            Self::BigInt(col) => col.clear(),
            Self::Double(col) => col.clear(),
            Self::Text(col) => col.clear(),
            Self::Json(col) => col.clear(),
        }
    }
}

/// Lot de requête de modification (DELETE / UPDATE / INSERT)
pub struct StatementBatch {
    template: BatchTemplate,
    threshold: usize,
    connection: Arc<SessionConnection>,
    log: Arc<OperationLog>,
    columns: Vec<ColumnBuffer>,
    records: Vec<LogRecord>,
    rows: usize,
    flushes: u64,
}

impl StatementBatch {
    pub fn new(
        template: BatchTemplate,
        threshold: usize,
        connection: Arc<SessionConnection>,
        log: Arc<OperationLog>,
    ) -> Self {
        let threshold = threshold.max(1);
        let columns = template
            .columns
            .iter()
            .map(|&c| ColumnBuffer::new(c, threshold))
            .collect();
        Self {
            template,
            threshold,
            connection,
            log,
            columns,
            records: Vec::new(),
            rows: 0,
            flushes: 0,
        }
    }

    /// Nombre de flushs exécutés
    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

impl BatchWriter for StatementBatch {
    fn kind(&self) -> TableKind {
        self.template.kind
    }

    fn add(&mut self, row: BatchRow) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return Err(OpsError::InvalidRow {
                table: self.template.kind,
                reason: format!(
                    "expected {} values, got {}",
                    self.columns.len(),
                    row.values.len()
                ),
            });
        }
        if let Some((index, _)) = self
            .columns
            .iter()
            .zip(&row.values)
            .enumerate()
            .find(|(_, (column, value))| !column.accepts(value))
        {
            return Err(OpsError::InvalidRow {
                table: self.template.kind,
                reason: format!("value {} has the wrong type", index + 1),
            });
        }

        for (column, value) in self.columns.iter_mut().zip(row.values) {
            column.push(value);
        }
        if let Some(record) = row.log {
            self.records.push(record);
        }
        self.rows += 1;

        if self.rows >= self.threshold {
            self.force_flush()?;
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.rows
    }

    fn threshold(&self) -> usize {
        self.threshold
    }

    fn force_flush(&mut self) -> Result<u64> {
        if self.rows == 0 {
            return Ok(0);
        }

        let rows = std::mem::take(&mut self.rows);
        let params: Vec<SqlParam> = self.columns.iter_mut().map(ColumnBuffer::take).collect();
        let records = std::mem::take(&mut self.records);
        let log = &self.log;

        self.flushes += 1;
        let affected = self
            .connection
            .execute_then(&self.template.statement, &params, |_| {
                log.record_flushed(records)
            })?;

        debug!(
            writer = %self.template.kind,
            rows = rows,
            affected = affected,
            "Flushed batch"
        );
        Ok(affected)
    }

    fn discard(&mut self) -> usize {
        let rows = std::mem::take(&mut self.rows);
        for column in &mut self.columns {
            column.clear();
        }
        self.records.clear();
        if rows > 0 {
            trace!(writer = %self.template.kind, rows = rows, "Discarded pending batch");
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseAdapter, StatementKind};
    use crate::testing::{MemoryAdapter, MemoryDatabase};

    fn delete_template() -> BatchTemplate {
        BatchTemplate {
            kind: TableKind::FeatureDelete,
            statement: Statement::new(
                StatementKind::DeleteFeatures,
                "DELETE FROM citydb.feature WHERE id = ANY($1::bigint[])",
            ),
            columns: vec![ColumnType::BigInt],
        }
    }

    fn batch(db: &Arc<MemoryDatabase>, threshold: usize) -> (StatementBatch, Arc<OperationLog>) {
        let adapter = MemoryAdapter::new(Arc::clone(db));
        let connection = Arc::new(SessionConnection::new(adapter.connect().unwrap()));
        let log = Arc::new(OperationLog::new(true));
        (
            StatementBatch::new(delete_template(), threshold, connection, Arc::clone(&log)),
            log,
        )
    }

    fn record(id: i64) -> LogRecord {
        LogRecord {
            id,
            objectid: None,
            objectclass: "Building".into(),
        }
    }

    #[test]
    fn test_pending_stays_below_threshold() {
        let db = Arc::new(MemoryDatabase::new());
        let (mut writer, _) = batch(&db, 3);
        for id in 1..=10 {
            writer.add(BatchRow::new(vec![SqlValue::BigInt(id)])).unwrap();
            assert!(writer.pending() < writer.threshold());
        }
        assert_eq!(writer.flushes(), 3);
        assert_eq!(writer.pending(), 1);

        writer.force_flush().unwrap();
        assert_eq!(writer.pending(), 0);
        assert_eq!(db.executions_of(StatementKind::DeleteFeatures), vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_force_flush_on_empty_batch_is_noop() {
        let db = Arc::new(MemoryDatabase::new());
        let (mut writer, _) = batch(&db, 3);
        assert_eq!(writer.force_flush().unwrap(), 0);
        assert!(db.executions_of(StatementKind::DeleteFeatures).is_empty());
    }

    #[test]
    fn test_failed_flush_leaves_buffer_empty() {
        let db = Arc::new(MemoryDatabase::new());
        db.fail_when(StatementKind::DeleteFeatures, |_| true);
        let (mut writer, log) = batch(&db, 2);

        writer
            .add(BatchRow::logged(vec![SqlValue::BigInt(1)], record(1)))
            .unwrap();
        let err = writer
            .add(BatchRow::logged(vec![SqlValue::BigInt(2)], record(2)))
            .unwrap_err();
        assert!(matches!(err, OpsError::Database(_)));
        assert_eq!(writer.pending(), 0);
        assert_eq!(log.pending_count(), 0);
    }

    #[test]
    fn test_log_records_flushed_with_batch() {
        let db = Arc::new(MemoryDatabase::new());
        let (mut writer, log) = batch(&db, 2);
        writer
            .add(BatchRow::logged(vec![SqlValue::BigInt(1)], record(1)))
            .unwrap();
        assert_eq!(log.pending_count(), 0);
        writer
            .add(BatchRow::logged(vec![SqlValue::BigInt(2)], record(2)))
            .unwrap();
        assert_eq!(log.pending_count(), 2);
    }

    #[test]
    fn test_rejects_malformed_rows() {
        let db = Arc::new(MemoryDatabase::new());
        let (mut writer, _) = batch(&db, 2);
        let err = writer.add(BatchRow::new(vec![])).unwrap_err();
        assert!(matches!(err, OpsError::InvalidRow { .. }));
        let err = writer
            .add(BatchRow::new(vec![SqlValue::Text("x".into())]))
            .unwrap_err();
        assert!(matches!(err, OpsError::InvalidRow { .. }));
        assert_eq!(writer.pending(), 0);
    }

    #[test]
    fn test_discard() {
        let db = Arc::new(MemoryDatabase::new());
        let (mut writer, _) = batch(&db, 5);
        writer.add(BatchRow::new(vec![SqlValue::BigInt(1)])).unwrap();
        writer.add(BatchRow::new(vec![SqlValue::Null])).unwrap();
        assert_eq!(writer.discard(), 2);
        assert_eq!(writer.pending(), 0);
        writer.force_flush().unwrap();
        assert!(db.executions_of(StatementKind::DeleteFeatures).is_empty());
    }
}
