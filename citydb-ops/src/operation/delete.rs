//! Suppression et terminaison de features
//!
//! La suppression retire les lignes (`property` suit par cascade). La
//! terminaison renseigne `termination_date` et conserve l'historique.

use std::sync::Arc;

use crate::batch::{BatchRow, BatchTemplate, BatchWriter, StatementBatch, TableKind};
use crate::context::{WorkerContext, WriterEnv, WriterFactory};
use crate::database::{ColumnType, SqlValue, Statement, StatementKind};
use crate::error::{OpsError, Result};
use crate::log::LogRecord;
use crate::session::Command;

use super::{Metadata, UNKNOWN_CLASS};

/// Mode de retrait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    #[default]
    Delete,
    Terminate,
}

/// Feature à retirer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteItem {
    pub id: i64,
    pub objectid: Option<String>,
    pub objectclass: Option<String>,
}

impl DeleteItem {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            objectid: None,
            objectclass: None,
        }
    }
}

impl From<i64> for DeleteItem {
    fn from(id: i64) -> Self {
        Self::new(id)
    }
}

/// Commande de suppression
#[derive(Debug, Clone, Default)]
pub struct DeleteCommand {
    mode: DeleteMode,
    metadata: Metadata,
}

impl DeleteCommand {
    pub fn new(mode: DeleteMode, metadata: Metadata) -> Self {
        Self { mode, metadata }
    }

    pub fn mode(&self) -> DeleteMode {
        self.mode
    }
}

pub(crate) fn delete_template(schema: &str) -> BatchTemplate {
    BatchTemplate {
        kind: TableKind::FeatureDelete,
        statement: Statement::new(
            StatementKind::DeleteFeatures,
            format!("DELETE FROM {}.feature WHERE id = ANY($1::bigint[])", schema),
        ),
        columns: vec![ColumnType::BigInt],
    }
}

pub(crate) fn terminate_template(schema: &str) -> BatchTemplate {
    BatchTemplate {
        kind: TableKind::FeatureTerminate,
        statement: Statement::new(
            StatementKind::TerminateFeatures,
            format!(
                r#"
                UPDATE {schema}.feature AS f SET
                    termination_date = now(),
                    last_modification_date = now(),
                    updating_person = COALESCE(u.updating_person, f.updating_person),
                    reason_for_update = COALESCE(u.reason_for_update, f.reason_for_update),
                    lineage = COALESCE(u.lineage, f.lineage)
                FROM unnest($1::bigint[], $2::text[], $3::text[], $4::text[])
                    AS u(id, updating_person, reason_for_update, lineage)
                WHERE f.id = u.id AND f.termination_date IS NULL
                "#
            ),
        ),
        columns: vec![
            ColumnType::BigInt,
            ColumnType::Text,
            ColumnType::Text,
            ColumnType::Text,
        ],
    }
}

impl WriterFactory for DeleteCommand {
    fn create_writer(&self, kind: TableKind, env: &WriterEnv) -> Result<Box<dyn BatchWriter>> {
        let template = match kind {
            TableKind::FeatureDelete => delete_template(&env.schema),
            TableKind::FeatureTerminate => terminate_template(&env.schema),
            other => return Err(OpsError::UnsupportedTable(other)),
        };
        Ok(Box::new(StatementBatch::new(
            template,
            env.batch_size,
            Arc::clone(&env.connection),
            Arc::clone(&env.log),
        )))
    }
}

impl Command for DeleteCommand {
    type Item = DeleteItem;
    type Output = ();

    fn name(&self) -> &'static str {
        match self.mode {
            DeleteMode::Delete => "delete",
            DeleteMode::Terminate => "terminate",
        }
    }

    fn apply(&self, ctx: &mut WorkerContext, item: DeleteItem) -> Result<()> {
        let record = LogRecord {
            id: item.id,
            objectclass: item.objectclass.unwrap_or_else(|| UNKNOWN_CLASS.to_string()),
            objectid: item.objectid,
        };
        match self.mode {
            DeleteMode::Delete => ctx.add(
                TableKind::FeatureDelete,
                BatchRow::logged(vec![SqlValue::BigInt(item.id)], record),
            ),
            DeleteMode::Terminate => ctx.add(
                TableKind::FeatureTerminate,
                BatchRow::logged(
                    vec![
                        SqlValue::BigInt(item.id),
                        self.metadata.updating_person.clone().into(),
                        self.metadata.reason_for_update.clone().into(),
                        self.metadata.lineage.clone().into(),
                    ],
                    record,
                ),
            ),
        }
    }
}
