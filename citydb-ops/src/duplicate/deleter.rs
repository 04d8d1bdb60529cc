//! Retrait des doublons confirmés en base

use std::sync::Arc;

use tracing::{info, warn};

use crate::database::DatabaseAdapter;
use crate::error::{OpsError, Result};
use crate::operation::{DeleteCommand, DeleteItem, DeleteMode, Deleter, Metadata};
use crate::session::{SessionOptions, SessionState, TransactionMode};
use crate::statistics::Statistics;

use super::cache::IdentityCache;

/// Supprime ou termine les features confirmées dans le cache
///
/// Utilise une session de suppression imbriquée, annulée en aperçu.
pub struct DuplicateDeleter {
    adapter: Arc<dyn DatabaseAdapter>,
    mode: DeleteMode,
    metadata: Metadata,
    preview: bool,
    threads: Option<usize>,
    batch_size: Option<usize>,
}

impl DuplicateDeleter {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, mode: DeleteMode, metadata: Metadata) -> Self {
        Self {
            adapter,
            mode,
            metadata,
            preview: false,
            threads: None,
            batch_size: None,
        }
    }

    pub fn preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    pub fn batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Retire toutes les features confirmées
    ///
    /// # Errors
    /// Erreur de lecture du cache (la session est alors annulée) ou premier
    /// échec de la session de suppression.
    pub fn run(&self, cache: &IdentityCache) -> Result<Statistics> {
        let deleter = Deleter::new(DeleteCommand::new(self.mode, self.metadata.clone()));
        let options = SessionOptions {
            threads: self.threads,
            batch_size: self.batch_size,
            transaction_mode: if self.preview {
                TransactionMode::AutoRollback
            } else {
                TransactionMode::Manual
            },
            ..Default::default()
        };
        deleter.start(self.adapter.as_ref(), options)?;

        let fed = cache.for_each_confirmed(&mut |id, objectid| {
            // Le résultat de chaque élément est suivi par la session
            let _ = deleter.submit(DeleteItem {
                id,
                objectid: Some(objectid.to_string()),
                objectclass: None,
            });
            deleter.should_continue()
        });

        if let Err(e) = fed {
            if let Err(abort_error) = deleter.abort_session() {
                warn!(error = %abort_error, "Failed to abort duplicate removal");
            }
            return Err(OpsError::from(e));
        }

        let state = deleter.commit_session()?;
        let statistics = deleter.statistics();
        info!(
            mode = ?self.mode,
            preview = self.preview,
            removed = statistics.committed,
            rolled_back = statistics.rolled_back,
            committed = state == SessionState::Committed,
            "Duplicate removal finished"
        );
        Ok(statistics)
    }
}
