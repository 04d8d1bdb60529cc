//! Journal des éléments traités
//!
//! Une entrée passe par trois étapes: en attente dans un lot, "flushée"
//! (requête exécutée), puis commitée. Seul un commit réel de la connexion
//! déplace les entrées flushées vers les entrées commitées; un rollback les
//! abandonne. Sous auto-commit, une entrée n'est donc comptée que si le
//! commit de son lot a eu lieu avant un échec ultérieur.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{OpsError, Result};

/// Enregistrement joint à une ligne de lot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub objectid: Option<String>,
    pub objectclass: String,
}

/// Entrée de journal finalisée
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub objectid: Option<String>,
    pub objectclass: String,
    pub committed: bool,
}

#[derive(Debug, Default)]
struct LogState {
    flushed: Vec<LogRecord>,
    committed: Vec<LogEntry>,
    committed_by_class: BTreeMap<String, u64>,
    committed_total: u64,
    rolled_back: u64,
    commits: u64,
}

/// Journal d'une session
#[derive(Debug, Default)]
pub struct OperationLog {
    keep_entries: bool,
    state: Mutex<LogState>,
}

impl OperationLog {
    /// `keep_entries`: conserver chaque entrée commitée (sinon compteurs seuls)
    pub fn new(keep_entries: bool) -> Self {
        Self {
            keep_entries,
            state: Mutex::new(LogState::default()),
        }
    }

    /// Marque des enregistrements comme flushés
    pub fn record_flushed(&self, records: Vec<LogRecord>) {
        if records.is_empty() {
            return;
        }
        self.state.lock().flushed.extend(records);
    }

    /// Commit réussi: les entrées flushées deviennent commitées
    ///
    /// Retourne le nombre d'entrées finalisées.
    pub fn commit(&self) -> usize {
        let mut state = self.state.lock();
        state.commits += 1;
        let records = std::mem::take(&mut state.flushed);
        let count = records.len();
        for record in records {
            *state
                .committed_by_class
                .entry(record.objectclass.clone())
                .or_default() += 1;
            state.committed_total += 1;
            if self.keep_entries {
                state.committed.push(LogEntry {
                    id: record.id,
                    objectid: record.objectid,
                    objectclass: record.objectclass,
                    committed: true,
                });
            }
        }
        count
    }

    /// Rollback: les entrées flushées sont abandonnées
    pub fn rollback(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.flushed.len();
        state.flushed.clear();
        state.rolled_back += count as u64;
        count
    }

    /// Entrées commitées (vide si `keep_entries` est faux)
    pub fn committed_entries(&self) -> Vec<LogEntry> {
        self.state.lock().committed.clone()
    }

    /// Nombre d'entrées commitées
    pub fn committed_count(&self) -> u64 {
        self.state.lock().committed_total
    }

    /// Nombre d'entrées commitées par classe d'objet
    pub fn committed_by_class(&self) -> BTreeMap<String, u64> {
        self.state.lock().committed_by_class.clone()
    }

    /// Nombre d'entrées flushées puis annulées
    pub fn rolled_back_count(&self) -> u64 {
        self.state.lock().rolled_back
    }

    /// Nombre d'entrées flushées en attente de commit
    pub fn pending_count(&self) -> usize {
        self.state.lock().flushed.len()
    }

    /// Nombre de commits effectués
    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    /// Écrit les entrées commitées au format CSV (`id,objectid,objectclass`)
    pub fn write_csv(&self, path: &Path) -> Result<usize> {
        write_entries_csv(path, &self.committed_entries())
    }
}

/// Champ CSV (RFC 4180): entre guillemets s'il contient `,`, `"` ou un
/// saut de ligne, guillemets internes doublés
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Écrit des entrées de journal au format CSV
///
/// Utilisé tel quel pour agréger les journaux de plusieurs sessions.
pub fn write_entries_csv(path: &Path, entries: &[LogEntry]) -> Result<usize> {
    let write = || -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut out = std::io::BufWriter::new(file);
        writeln!(out, "id,objectid,objectclass")?;
        for entry in entries {
            writeln!(
                out,
                "{},{},{}",
                entry.id,
                csv_field(entry.objectid.as_deref().unwrap_or("")),
                csv_field(&entry.objectclass)
            )?;
        }
        out.flush()
    };
    write().map_err(|e| OpsError::Sink(format!("failed to write log {}: {}", path.display(), e)))?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, class: &str) -> LogRecord {
        LogRecord {
            id,
            objectid: Some(format!("obj-{}", id)),
            objectclass: class.to_string(),
        }
    }

    #[test]
    fn test_flushed_entries_only_count_after_commit() {
        let log = OperationLog::new(true);
        log.record_flushed(vec![record(1, "Building"), record(2, "Building")]);
        assert_eq!(log.committed_count(), 0);
        assert_eq!(log.pending_count(), 2);

        assert_eq!(log.commit(), 2);
        assert_eq!(log.committed_count(), 2);
        assert!(log.committed_entries().iter().all(|e| e.committed));
    }

    #[test]
    fn test_rollback_discards_flushed_entries() {
        let log = OperationLog::new(true);
        log.record_flushed(vec![record(1, "Building")]);
        log.commit();
        log.record_flushed(vec![record(2, "Road"), record(3, "Road")]);
        assert_eq!(log.rollback(), 2);

        assert_eq!(log.committed_count(), 1);
        assert_eq!(log.rolled_back_count(), 2);
        assert_eq!(log.committed_by_class().get("Road"), None);
        assert_eq!(log.committed_by_class().get("Building"), Some(&1));
    }

    #[test]
    fn test_counters_without_entries() {
        let log = OperationLog::new(false);
        log.record_flushed(vec![record(1, "Building")]);
        log.commit();
        assert_eq!(log.committed_count(), 1);
        assert!(log.committed_entries().is_empty());
        assert_eq!(log.commit_count(), 1);
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let log = OperationLog::new(true);
        log.record_flushed(vec![record(7, "Building")]);
        log.commit();

        assert_eq!(log.write_csv(&path).unwrap(), 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "id,objectid,objectclass\n7,obj-7,Building\n");
    }

    #[test]
    fn test_write_csv_quotes_special_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let entries = vec![
            LogEntry {
                id: 1,
                objectid: Some("a,b".into()),
                objectclass: "Building".into(),
                committed: true,
            },
            LogEntry {
                id: 2,
                objectid: Some("say \"hi\"".into()),
                objectclass: "Road\nPart".into(),
                committed: true,
            },
            LogEntry {
                id: 3,
                objectid: None,
                objectclass: "Bridge".into(),
                committed: true,
            },
        ];

        assert_eq!(write_entries_csv(&path, &entries).unwrap(), 3);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "id,objectid,objectclass\n1,\"a,b\",Building\n2,\"say \"\"hi\"\"\",\"Road\nPart\"\n3,,Bridge\n"
        );
    }
}
