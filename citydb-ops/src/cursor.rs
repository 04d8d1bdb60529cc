//! Parcours paginé des features en base
//!
//! Pagination par clé (`id > dernier id ORDER BY id LIMIT n`) sur une
//! connexion dédiée, indépendante de celle de la session qui consomme les
//! identifiants.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::database::{Connection, DatabaseAdapter, SqlParam, SqlValue, Statement, StatementKind};
use crate::error::{OpsError, Result};
use crate::feature::TypeFilter;
use crate::operation::DeleteItem;

/// Référence vers une feature en base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureRef {
    pub id: i64,
    pub objectid: Option<String>,
    pub objectclass: String,
}

impl From<FeatureRef> for DeleteItem {
    fn from(feature: FeatureRef) -> Self {
        Self {
            id: feature.id,
            objectid: feature.objectid,
            objectclass: Some(feature.objectclass),
        }
    }
}

fn select_statement(schema: &str, filtered: bool) -> Statement {
    let class_filter = if filtered {
        " AND objectclass = ANY($3::text[])"
    } else {
        ""
    };
    Statement::new(
        StatementKind::SelectIds,
        format!(
            "SELECT id, objectid, objectclass FROM {}.feature \
             WHERE id > $1 AND termination_date IS NULL{} ORDER BY id LIMIT $2",
            schema, class_filter
        ),
    )
}

/// Curseur sur les features non terminées
pub struct IdCursor {
    connection: Box<dyn Connection>,
    statement: Statement,
    classes: Option<Vec<Option<String>>>,
    page_size: usize,
    after: i64,
    buffer: VecDeque<FeatureRef>,
    exhausted: bool,
}

impl IdCursor {
    pub fn open(adapter: &dyn DatabaseAdapter, filter: &TypeFilter, page_size: usize) -> Result<Self> {
        let classes = (!filter.is_empty())
            .then(|| filter.classes().map(|c| Some(c.to_string())).collect::<Vec<_>>());
        Ok(Self {
            connection: adapter.connect()?,
            statement: select_statement(adapter.schema(), classes.is_some()),
            classes,
            page_size: page_size.max(1),
            after: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    fn fetch_page(&mut self) -> Result<()> {
        let mut params = vec![
            SqlParam::BigInt(self.after),
            SqlParam::BigInt(self.page_size as i64),
        ];
        if let Some(classes) = &self.classes {
            params.push(SqlParam::TextArray(classes.clone()));
        }
        let rows = self.connection.query(&self.statement, &params)?;
        if rows.len() < self.page_size {
            self.exhausted = true;
        }

        for row in rows {
            let id = row
                .first()
                .and_then(SqlValue::as_i64)
                .ok_or_else(|| OpsError::invalid_feature("?", "missing id column"))?;
            self.after = id;
            self.buffer.push_back(FeatureRef {
                id,
                objectid: row.get(1).and_then(SqlValue::as_str).map(str::to_string),
                objectclass: row
                    .get(2)
                    .and_then(SqlValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        debug!(after = self.after, buffered = self.buffer.len(), "Fetched id page");
        Ok(())
    }

    fn close(&mut self) {
        if let Err(e) = self.connection.rollback() {
            warn!(error = %e, "Failed to close cursor transaction");
        }
    }
}

impl Iterator for IdCursor {
    type Item = Result<FeatureRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                self.close();
                return Some(Err(e));
            }
            if self.exhausted {
                self.close();
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
