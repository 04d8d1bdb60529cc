//! Recherche par lot des objectids déjà présents en base

use std::sync::Arc;

use tracing::trace;

use crate::database::{SessionConnection, SqlParam, SqlValue, Statement, StatementKind};
use crate::error::Result;

use super::cache::IdentityCache;

/// Taille de lot maximale d'une recherche
pub const MAX_PROBE_BATCH: usize = 1000;

pub(crate) fn probe_statement(schema: &str) -> Statement {
    Statement::new(
        StatementKind::ProbeObjectIds,
        format!(
            "SELECT objectid, id FROM {}.feature \
             WHERE objectid = ANY($1::text[]) AND termination_date IS NULL",
            schema
        ),
    )
}

/// Finder propre à un worker
///
/// Accumule des objectids et interroge la base par lots de
/// `min(1000, max_in_operator_size)`. Les correspondances (features non
/// terminées) sont enregistrées dans le cache.
pub struct DuplicateFinder {
    statement: Statement,
    threshold: usize,
    connection: Arc<SessionConnection>,
    cache: Arc<IdentityCache>,
    pending: Vec<String>,
    found: usize,
}

impl DuplicateFinder {
    pub fn new(
        schema: &str,
        max_in_operator_size: usize,
        connection: Arc<SessionConnection>,
        cache: Arc<IdentityCache>,
    ) -> Self {
        let threshold = MAX_PROBE_BATCH.min(max_in_operator_size).max(1);
        Self {
            statement: probe_statement(schema),
            threshold,
            connection,
            cache,
            pending: Vec::with_capacity(threshold),
            found: 0,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Correspondances trouvées par ce finder
    pub fn found(&self) -> usize {
        self.found
    }

    /// Ajoute un objectid; interroge la base si le seuil est atteint
    pub fn add(&mut self, objectid: String) -> Result<()> {
        self.pending.push(objectid);
        if self.pending.len() >= self.threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Interroge la base pour les objectids en attente
    ///
    /// Le lot est vide au retour, même en cas d'erreur.
    pub fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let batch: Vec<Option<String>> = std::mem::take(&mut self.pending)
            .into_iter()
            .map(Some)
            .collect();
        let probed = batch.len();
        let rows = self
            .connection
            .query(&self.statement, &[SqlParam::TextArray(batch)])?;

        let mut matches = 0;
        for row in &rows {
            if let (Some(objectid), Some(id)) = (
                row.first().and_then(SqlValue::as_str),
                row.get(1).and_then(SqlValue::as_i64),
            ) {
                self.cache.confirm(objectid, id)?;
                matches += 1;
            }
        }
        self.found += matches;
        trace!(probed, matches, "Probed objectids");
        Ok(matches)
    }

    /// Retire les objectids en attente sans interroger la base
    pub fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }
}
