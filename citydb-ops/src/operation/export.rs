//! Export de features
//!
//! Les identifiants soumis sont regroupés par worker; chaque lot est lu en
//! une requête `id = ANY($1)` puis transmis à la destination.

use std::sync::Arc;

use tracing::debug;

use crate::batch::{BatchRow, BatchWriter, TableKind};
use crate::context::{WorkerContext, WriterEnv, WriterFactory};
use crate::database::{Row, SessionConnection, SqlParam, SqlValue, Statement, StatementKind};
use crate::error::{OpsError, Result};
use crate::feature::{ExportedFeature, FeatureSink};
use crate::log::{LogRecord, OperationLog};
use crate::session::Command;

pub(crate) fn fetch_statement(schema: &str) -> Statement {
    Statement::new(
        StatementKind::FetchFeatures,
        format!(
            "SELECT id, objectid, objectclass, content::text FROM {}.feature \
             WHERE id = ANY($1::bigint[]) ORDER BY id",
            schema
        ),
    )
}

/// Lecteur par lot des features à exporter
pub struct FeatureFetcher {
    statement: Statement,
    threshold: usize,
    connection: Arc<SessionConnection>,
    log: Arc<OperationLog>,
    sink: Arc<dyn FeatureSink>,
    ids: Vec<Option<i64>>,
}

impl FeatureFetcher {
    pub fn new(env: &WriterEnv, sink: Arc<dyn FeatureSink>) -> Self {
        Self {
            statement: fetch_statement(&env.schema),
            threshold: env.batch_size.max(1),
            connection: Arc::clone(&env.connection),
            log: Arc::clone(&env.log),
            sink,
            ids: Vec::new(),
        }
    }
}

fn decode_row(row: &Row) -> Result<ExportedFeature> {
    let id = row
        .first()
        .and_then(SqlValue::as_i64)
        .ok_or_else(|| OpsError::invalid_feature("?", "missing id column"))?;
    let objectclass = row
        .get(2)
        .and_then(SqlValue::as_str)
        .ok_or_else(|| OpsError::invalid_feature(id.to_string(), "missing objectclass"))?
        .to_string();
    let content = match row.get(3) {
        Some(SqlValue::Text(text)) => serde_json::from_str(text)
            .map_err(|e| OpsError::invalid_feature(id.to_string(), format!("invalid content: {}", e)))?,
        Some(SqlValue::Json(value)) => value.clone(),
        _ => serde_json::Value::Null,
    };
    Ok(ExportedFeature {
        id,
        objectid: row.get(1).and_then(SqlValue::as_str).map(str::to_string),
        objectclass,
        content,
    })
}

impl BatchWriter for FeatureFetcher {
    fn kind(&self) -> TableKind {
        TableKind::FeatureFetch
    }

    fn add(&mut self, row: BatchRow) -> Result<()> {
        let id = row
            .values
            .first()
            .and_then(SqlValue::as_i64)
            .ok_or_else(|| OpsError::InvalidRow {
                table: TableKind::FeatureFetch,
                reason: "expected a feature id".into(),
            })?;
        self.ids.push(Some(id));
        if self.ids.len() >= self.threshold {
            self.force_flush()?;
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.ids.len()
    }

    fn threshold(&self) -> usize {
        self.threshold
    }

    fn force_flush(&mut self) -> Result<u64> {
        if self.ids.is_empty() {
            return Ok(0);
        }
        let params = [SqlParam::BigIntArray(std::mem::take(&mut self.ids))];
        let sink = &self.sink;
        let log = &self.log;

        let written = self
            .connection
            .query_then(&self.statement, &params, |rows| -> Result<u64> {
                let mut records = Vec::with_capacity(rows.len());
                for row in &rows {
                    let feature = decode_row(row)?;
                    records.push(LogRecord {
                        id: feature.id,
                        objectid: feature.objectid.clone(),
                        objectclass: feature.objectclass.clone(),
                    });
                    sink.write(feature)?;
                }
                let written = records.len() as u64;
                log.record_flushed(records);
                Ok(written)
            })??;

        debug!(features = written, "Exported batch");
        Ok(written)
    }

    fn discard(&mut self) -> usize {
        let discarded = self.ids.len();
        self.ids.clear();
        discarded
    }
}

/// Commande d'export vers une destination
pub struct ExportCommand {
    sink: Arc<dyn FeatureSink>,
}

impl ExportCommand {
    pub fn new(sink: Arc<dyn FeatureSink>) -> Self {
        Self { sink }
    }
}

impl WriterFactory for ExportCommand {
    fn create_writer(&self, kind: TableKind, env: &WriterEnv) -> Result<Box<dyn BatchWriter>> {
        match kind {
            TableKind::FeatureFetch => Ok(Box::new(FeatureFetcher::new(env, Arc::clone(&self.sink)))),
            other => Err(OpsError::UnsupportedTable(other)),
        }
    }
}

impl Command for ExportCommand {
    type Item = i64;
    type Output = ();

    fn name(&self) -> &'static str {
        "export"
    }

    fn apply(&self, ctx: &mut WorkerContext, id: i64) -> Result<()> {
        ctx.add(TableKind::FeatureFetch, BatchRow::new(vec![SqlValue::BigInt(id)]))
    }
}
