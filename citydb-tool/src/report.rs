//! Rapport d'opération
//!
//! Collecte les résultats des sessions d'une commande (import, export,
//! suppression) pour l'affichage console et la sauvegarde JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use citydb_ops::{DuplicateCounts, Statistics};
use serde::Serialize;

/// Statut global de l'opération
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationStatus {
    /// Tout a été commité
    Success,
    /// Certains fichiers ont échoué, d'autres ont été commités
    PartialSuccess,
    /// Aperçu: tout a été exécuté puis annulé
    Preview,
    /// Rien n'a été commité
    Failed,
}

/// Niveau de sévérité des erreurs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorLevel {
    /// Erreur fatale: opération abandonnée
    Fatal,
    /// Erreur: fichier annulé
    Error,
}

/// Erreur avec contexte
#[derive(Debug, Clone, Serialize)]
pub struct ReportError {
    pub level: ErrorLevel,
    /// Fichier source (optionnel)
    pub file: Option<String>,
    pub message: String,
}

/// Fichier ignoré
#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub file: String,
    pub reason: String,
}

/// Cumul des passages de détection des doublons
#[derive(Debug, Clone, Default, Serialize)]
pub struct DuplicateSummary {
    /// Fichiers analysés
    pub files_checked: usize,
    /// Occurrences répétées dans un même fichier
    pub in_file: u64,
    /// Occurrences déjà présentes en base
    pub in_database: u64,
    /// Features non transmises à l'import
    pub features_skipped: u64,
    /// Features retirées de la base avant import
    pub removed: u64,
    /// Features qui auraient été retirées (aperçu)
    pub removal_previewed: u64,
}

/// Rapport complet d'une commande
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    /// import, export, delete, terminate
    pub operation: String,
    pub status: OperationStatus,
    pub preview: bool,
    pub duration_secs: f64,

    pub files_processed: usize,
    pub files_failed: usize,
    pub files_skipped: usize,

    /// Éléments soumis aux sessions
    pub submitted: u64,
    /// Éléments commités
    pub committed: u64,
    /// Éléments en échec
    pub failed: u64,
    /// Éléments exécutés puis annulés
    pub rolled_back: u64,
    /// Commits effectués
    pub commits: u64,

    /// Éléments commités par classe d'objet
    pub by_class: BTreeMap<String, u64>,
    pub duplicates: DuplicateSummary,

    pub skipped_files: Vec<SkippedFile>,
    pub errors: Vec<ReportError>,
}

impl OperationReport {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            status: OperationStatus::Success,
            preview: false,
            duration_secs: 0.0,
            files_processed: 0,
            files_failed: 0,
            files_skipped: 0,
            submitted: 0,
            committed: 0,
            failed: 0,
            rolled_back: 0,
            commits: 0,
            by_class: BTreeMap::new(),
            duplicates: DuplicateSummary::default(),
            skipped_files: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Ajoute les statistiques d'une session
    pub fn record_statistics(&mut self, statistics: &Statistics) {
        self.submitted += statistics.submitted;
        self.committed += statistics.committed;
        self.failed += statistics.failed;
        self.rolled_back += statistics.rolled_back;
        self.commits += statistics.commits;
        for (class, count) in &statistics.by_class {
            *self.by_class.entry(class.clone()).or_default() += count;
        }
    }

    /// Ajoute les compteurs d'un passage de détection
    pub fn record_duplicates(&mut self, counts: &DuplicateCounts) {
        self.duplicates.files_checked += 1;
        self.duplicates.in_file += counts.in_file;
        self.duplicates.in_database += counts.in_database;
        self.duplicates.removed += counts.removed;
        self.duplicates.removal_previewed += counts.removal_previewed;
    }

    /// Features écartées par la détection des doublons
    pub fn record_duplicate_skips(&mut self, skipped: u64) {
        self.duplicates.features_skipped += skipped;
    }

    pub fn record_file_success(&mut self) {
        self.files_processed += 1;
    }

    pub fn record_file_skipped(&mut self, file: &str, reason: &str) {
        self.files_skipped += 1;
        self.skipped_files.push(SkippedFile {
            file: file.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn record_file_failure(&mut self, file: &str, message: &str) {
        self.files_processed += 1;
        self.files_failed += 1;
        self.errors.push(ReportError {
            level: ErrorLevel::Error,
            file: Some(file.to_string()),
            message: message.to_string(),
        });
    }

    /// Erreur ayant interrompu l'opération
    pub fn record_fatal(&mut self, message: &str) {
        self.errors.push(ReportError {
            level: ErrorLevel::Fatal,
            file: None,
            message: message.to_string(),
        });
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_secs = duration.as_secs_f64();
    }

    /// Détermine le statut final basé sur les erreurs
    pub fn finalize(&mut self) {
        let has_fatal = self.errors.iter().any(|e| e.level == ErrorLevel::Fatal);
        let has_errors = !self.errors.is_empty();

        self.status = if has_fatal {
            OperationStatus::Failed
        } else if has_errors && self.committed > 0 {
            OperationStatus::PartialSuccess
        } else if has_errors {
            OperationStatus::Failed
        } else if self.preview {
            OperationStatus::Preview
        } else {
            OperationStatus::Success
        };
    }

    /// Affiche le rapport sur la console
    pub fn display(&self) {
        println!("\n{}", "=".repeat(60));
        println!("{} REPORT", self.operation.to_uppercase());
        println!("{}", "=".repeat(60));

        println!("\nStatus: {:?}", self.status);
        println!("Duration: {:.2}s", self.duration_secs);
        if self.status == OperationStatus::Failed && self.committed == 0 {
            println!("No work succeeded, nothing was committed");
        }

        println!("\n--- SUMMARY ---");
        if self.files_processed + self.files_skipped > 0 {
            println!(
                "Files: {} processed, {} failed, {} skipped",
                self.files_processed, self.files_failed, self.files_skipped
            );
        }
        println!(
            "Features: {} submitted, {} committed, {} failed, {} rolled back",
            self.submitted, self.committed, self.failed, self.rolled_back
        );
        println!("Commits: {}", self.commits);

        if !self.by_class.is_empty() {
            println!("\n--- BY CLASS ---");
            for (class, count) in &self.by_class {
                println!("  {}: {}", class, count);
            }
        }

        if self.duplicates.files_checked > 0 {
            let d = &self.duplicates;
            println!("\n--- DUPLICATES ---");
            println!(
                "In file: {}, in database: {}, skipped: {}",
                d.in_file, d.in_database, d.features_skipped
            );
            if d.removed > 0 || d.removal_previewed > 0 {
                println!("Removed: {} (previewed: {})", d.removed, d.removal_previewed);
            }
        }

        if !self.skipped_files.is_empty() {
            println!("\n--- SKIPPED FILES ({}) ---", self.skipped_files.len());
            for s in self.skipped_files.iter().take(10) {
                println!("  {}: {}", s.file, s.reason);
            }
            if self.skipped_files.len() > 10 {
                println!("  ... and {} more", self.skipped_files.len() - 10);
            }
        }

        if !self.errors.is_empty() {
            println!("\n--- ERRORS ({}) ---", self.errors.len());
            for e in self.errors.iter().take(20) {
                let location = e.file.as_deref().map(|f| format!("[{}]", f)).unwrap_or_default();
                println!("  {:?} {} {}", e.level, location, e.message);
            }
            if self.errors.len() > 20 {
                println!("  ... and {} more", self.errors.len() - 20);
            }
        }

        println!("\n{}", "=".repeat(60));
    }

    /// Sauvegarde le rapport en JSON
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Affichage compact pour le résumé
    pub fn summary(&self) -> String {
        format!(
            "{}: {} committed, {} failed, {} errors",
            self.operation,
            self.committed,
            self.failed,
            self.errors.len()
        )
    }
}
