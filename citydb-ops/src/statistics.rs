//! Statistiques d'une session

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::log::OperationLog;

/// Statistiques agrégées d'une session
///
/// Construites à partir du journal: seules les entrées commitées comptent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    /// Éléments soumis
    pub submitted: u64,
    /// Éléments dont la commande a échoué
    pub failed: u64,
    /// Éléments commités
    pub committed: u64,
    /// Éléments flushés puis annulés
    pub rolled_back: u64,
    /// Commits effectués (checkpoints inclus)
    pub commits: u64,
    /// Éléments commités par classe d'objet
    pub by_class: BTreeMap<String, u64>,
    /// Durée de la session
    pub duration_secs: f64,
}

impl Statistics {
    pub(crate) fn collect(log: &OperationLog, submitted: u64, failed: u64, duration: Duration) -> Self {
        Self {
            submitted,
            failed,
            committed: log.committed_count(),
            rolled_back: log.rolled_back_count(),
            commits: log.commit_count(),
            by_class: log.committed_by_class(),
            duration_secs: duration.as_secs_f64(),
        }
    }

    /// Fusionne les statistiques d'une autre session
    pub fn merge(&mut self, other: &Statistics) {
        self.submitted += other.submitted;
        self.failed += other.failed;
        self.committed += other.committed;
        self.rolled_back += other.rolled_back;
        self.commits += other.commits;
        self.duration_secs += other.duration_secs;
        for (class, count) in &other.by_class {
            *self.by_class.entry(class.clone()).or_default() += count;
        }
    }

    /// Aucun élément commité
    pub fn is_empty(&self) -> bool {
        self.committed == 0
    }
}
