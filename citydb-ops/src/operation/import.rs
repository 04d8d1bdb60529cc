//! Import de features
//!
//! Chaque feature reçoit un identifiant tiré d'un bloc réservé par le
//! worker, puis est écrite dans `feature` avec ses attributs dans
//! `property`. La contrainte `property.feature_id` est différée: l'ordre des
//! flushs entre les deux tables n'a pas d'importance avant le commit.

use std::sync::Arc;

use crate::batch::{BatchRow, BatchTemplate, BatchWriter, StatementBatch, TableKind};
use crate::context::{WorkerContext, WriterEnv, WriterFactory};
use crate::database::{ColumnType, SqlValue, Statement, StatementKind};
use crate::error::{OpsError, Result};
use crate::feature::{AttributeValue, CityFeature};
use crate::log::LogRecord;
use crate::session::Command;

use super::Metadata;

pub(crate) fn reserve_ids_statement(schema: &str) -> Statement {
    Statement::new(
        StatementKind::ReserveIds,
        format!(
            "SELECT nextval('{}.feature_seq') FROM generate_series(1, $1::bigint)",
            schema
        ),
    )
}

pub(crate) fn feature_template(schema: &str, srid: u32) -> BatchTemplate {
    BatchTemplate {
        kind: TableKind::FeatureInsert,
        statement: Statement::new(
            StatementKind::InsertFeatures,
            format!(
                r#"
                INSERT INTO {schema}.feature (
                    id, objectclass, objectid, identifier, envelope,
                    creation_date, last_modification_date,
                    updating_person, reason_for_update, lineage, content
                )
                SELECT
                    u.id, u.objectclass, u.objectid, u.identifier,
                    CASE WHEN u.xmin IS NULL THEN NULL
                         ELSE ST_MakeEnvelope(u.xmin, u.ymin, u.xmax, u.ymax, {srid}) END,
                    now(), now(),
                    u.updating_person, u.reason_for_update, u.lineage, u.content
                FROM unnest(
                    $1::bigint[], $2::text[], $3::text[], $4::text[],
                    $5::float8[], $6::float8[], $7::float8[], $8::float8[],
                    $9::text[], $10::text[], $11::text[], $12::jsonb[]
                ) AS u(
                    id, objectclass, objectid, identifier,
                    xmin, ymin, xmax, ymax,
                    updating_person, reason_for_update, lineage, content
                )
                "#
            ),
        ),
        columns: vec![
            ColumnType::BigInt,
            ColumnType::Text,
            ColumnType::Text,
            ColumnType::Text,
            ColumnType::Double,
            ColumnType::Double,
            ColumnType::Double,
            ColumnType::Double,
            ColumnType::Text,
            ColumnType::Text,
            ColumnType::Text,
            ColumnType::Json,
        ],
    }
}

pub(crate) fn property_template(schema: &str) -> BatchTemplate {
    BatchTemplate {
        kind: TableKind::PropertyInsert,
        statement: Statement::new(
            StatementKind::InsertProperties,
            format!(
                "INSERT INTO {}.property (feature_id, name, val_string, val_double, val_int) \
                 SELECT * FROM unnest($1::bigint[], $2::text[], $3::text[], $4::float8[], $5::bigint[])",
                schema
            ),
        ),
        columns: vec![
            ColumnType::BigInt,
            ColumnType::Text,
            ColumnType::Text,
            ColumnType::Double,
            ColumnType::BigInt,
        ],
    }
}

/// Commande d'import
#[derive(Debug, Clone, Default)]
pub struct ImportCommand {
    metadata: Metadata,
}

impl ImportCommand {
    pub fn new(metadata: Metadata) -> Self {
        Self { metadata }
    }
}

fn property_row(feature_id: i64, name: &str, value: &AttributeValue) -> BatchRow {
    let (text, double, int) = match value {
        AttributeValue::Text(v) => (SqlValue::Text(v.clone()), SqlValue::Null, SqlValue::Null),
        AttributeValue::Double(v) => (SqlValue::Null, SqlValue::Double(*v), SqlValue::Null),
        AttributeValue::Int(v) => (SqlValue::Null, SqlValue::Null, SqlValue::BigInt(*v)),
    };
    BatchRow::new(vec![
        SqlValue::BigInt(feature_id),
        SqlValue::Text(name.to_string()),
        text,
        double,
        int,
    ])
}

impl WriterFactory for ImportCommand {
    fn create_writer(&self, kind: TableKind, env: &WriterEnv) -> Result<Box<dyn BatchWriter>> {
        let template = match kind {
            TableKind::FeatureInsert => feature_template(&env.schema, env.srid),
            TableKind::PropertyInsert => property_template(&env.schema),
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

impl Command for ImportCommand {
    type Item = CityFeature;
    /// Identifiant attribué
    type Output = i64;

    fn name(&self) -> &'static str {
        "import"
    }

    fn apply(&self, ctx: &mut WorkerContext, feature: CityFeature) -> Result<i64> {
        if feature.objectclass.trim().is_empty() {
            return Err(OpsError::invalid_feature(feature.label(), "missing objectclass"));
        }

        let id = ctx.next_id(reserve_ids_statement)?;
        let (min, max) = match feature.envelope {
            Some(env) => (env.min.map(Some), env.max.map(Some)),
            None => ([None; 3], [None; 3]),
        };

        let properties: Vec<BatchRow> = feature
            .attributes
            .iter()
            .map(|(name, value)| property_row(id, name, value))
            .collect();

        let record = LogRecord {
            id,
            objectid: feature.objectid.clone(),
            objectclass: feature.objectclass.clone(),
        };
        ctx.add(
            TableKind::FeatureInsert,
            BatchRow::logged(
                vec![
                    SqlValue::BigInt(id),
                    SqlValue::Text(feature.objectclass),
                    feature.objectid.into(),
                    feature.identifier.into(),
                    min[0].into(),
                    min[1].into(),
                    max[0].into(),
                    max[1].into(),
                    self.metadata.updating_person.clone().into(),
                    self.metadata.reason_for_update.clone().into(),
                    self.metadata.lineage.clone().into(),
                    SqlValue::Json(feature.content),
                ],
                record,
            ),
        )?;

        for row in properties {
            ctx.add(TableKind::PropertyInsert, row)?;
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_template_columns() {
        let template = feature_template("citydb", 2154);
        assert_eq!(template.columns.len(), 12);
        assert!(template.statement.sql.contains("$12::jsonb[]"));
        assert!(template.statement.sql.contains("2154"));
    }

    #[test]
    fn test_property_row_typed_columns() {
        let row = property_row(3, "height", &AttributeValue::Double(12.5));
        assert_eq!(row.values[0], SqlValue::BigInt(3));
        assert_eq!(row.values[2], SqlValue::Null);
        assert_eq!(row.values[3], SqlValue::Double(12.5));
        assert_eq!(row.values[4], SqlValue::Null);

        let row = property_row(3, "storeys", &AttributeValue::Int(4));
        assert_eq!(row.values[4], SqlValue::BigInt(4));
    }
}
