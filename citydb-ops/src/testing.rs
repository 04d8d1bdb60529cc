//! Base de données en mémoire pour les tests et benchmarks
//!
//! Interprète les requêtes du moteur d'après leur [`StatementKind`], sans
//! SQL. Les écritures d'une connexion restent en attente jusqu'au commit;
//! les lectures voient l'état commité. Chaque exécution est enregistrée et
//! des échecs peuvent être injectés par type de requête.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::database::{Connection, DatabaseAdapter, Row, SqlParam, SqlValue, Statement, StatementKind};
use crate::error::DbError;

/// Feature stockée
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFeature {
    pub id: i64,
    pub objectclass: String,
    pub objectid: Option<String>,
    pub identifier: Option<String>,
    /// `[xmin, ymin, xmax, ymax]`
    pub envelope: Option<[f64; 4]>,
    pub terminated: bool,
    pub updating_person: Option<String>,
    pub reason_for_update: Option<String>,
    pub lineage: Option<String>,
    pub content: serde_json::Value,
}

/// Attribut stocké
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProperty {
    pub feature_id: i64,
    pub name: String,
    pub value: SqlValue,
}

/// Exécution enregistrée
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub kind: StatementKind,
    /// Taille du lot (longueur du premier tableau)
    pub rows: usize,
}

type FailurePredicate = Box<dyn Fn(&[SqlParam]) -> bool + Send + Sync>;

#[derive(Default)]
struct Tables {
    features: BTreeMap<i64, StoredFeature>,
    properties: Vec<StoredProperty>,
}

/// Base en mémoire partagée par toutes les connexions
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
    sequence: AtomicU64,
    executions: Mutex<Vec<Execution>>,
    failures: Mutex<Vec<(StatementKind, FailurePredicate)>>,
    fail_commit: AtomicBool,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    /// Deux requêtes ont été vues en même temps sur une connexion
    overlapped: AtomicBool,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) as i64 + 1
    }

    /// Insère directement une feature commitée
    pub fn insert_feature(&self, objectid: &str, objectclass: &str) -> i64 {
        let id = self.next_id();
        self.tables.lock().features.insert(
            id,
            StoredFeature {
                id,
                objectclass: objectclass.to_string(),
                objectid: Some(objectid.to_string()),
                identifier: None,
                envelope: None,
                terminated: false,
                updating_person: None,
                reason_for_update: None,
                lineage: None,
                content: serde_json::json!({ "type": objectclass }),
            },
        );
        id
    }

    /// Termine directement une feature
    pub fn terminate(&self, id: i64) {
        if let Some(feature) = self.tables.lock().features.get_mut(&id) {
            feature.terminated = true;
        }
    }

    pub fn feature(&self, id: i64) -> Option<StoredFeature> {
        self.tables.lock().features.get(&id).cloned()
    }

    pub fn features(&self) -> Vec<StoredFeature> {
        self.tables.lock().features.values().cloned().collect()
    }

    /// Identifiants des features non terminées
    pub fn live_ids(&self) -> Vec<i64> {
        self.tables
            .lock()
            .features
            .values()
            .filter(|f| !f.terminated)
            .map(|f| f.id)
            .collect()
    }

    pub fn properties_of(&self, feature_id: i64) -> Vec<StoredProperty> {
        self.tables
            .lock()
            .properties
            .iter()
            .filter(|p| p.feature_id == feature_id)
            .cloned()
            .collect()
    }

    /// Fait échouer les requêtes `kind` dont les paramètres vérifient `predicate`
    pub fn fail_when<F>(&self, kind: StatementKind, predicate: F)
    where
        F: Fn(&[SqlParam]) -> bool + Send + Sync + 'static,
    {
        self.failures.lock().push((kind, Box::new(predicate)));
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Une connexion a reçu une requête alors qu'une autre était en cours
    pub fn saw_overlapping_statements(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().clone()
    }

    /// Tailles des lots exécutés pour un type de requête
    pub fn executions_of(&self, kind: StatementKind) -> Vec<usize> {
        self.executions
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.rows)
            .collect()
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn check(&self, statement: &Statement, params: &[SqlParam]) -> Result<(), DbError> {
        let rows = match params.first() {
            Some(SqlParam::BigIntArray(v)) => v.len(),
            Some(SqlParam::TextArray(v)) => v.len(),
            Some(SqlParam::DoubleArray(v)) => v.len(),
            Some(SqlParam::JsonArray(v)) => v.len(),
            Some(SqlParam::BigInt(_) | SqlParam::Text(_)) => 1,
            None => 0,
        };
        self.executions.lock().push(Execution {
            kind: statement.kind,
            rows,
        });

        let failures = self.failures.lock();
        if failures
            .iter()
            .any(|(kind, predicate)| *kind == statement.kind && predicate(params))
        {
            return Err(DbError::with_sqlstate(
                format!("injected failure on {}", statement.kind),
                "XX000",
            ));
        }
        Ok(())
    }
}

/// Adaptateur vers une [`MemoryDatabase`]
pub struct MemoryAdapter {
    db: Arc<MemoryDatabase>,
    schema: String,
    max_batch_size: usize,
    max_in_operator_size: usize,
}

impl MemoryAdapter {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self {
            db,
            schema: "citydb".to_string(),
            max_batch_size: 1000,
            max_in_operator_size: 10_000,
        }
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_in_operator_size(mut self, size: usize) -> Self {
        self.max_in_operator_size = size;
        self
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }
}

impl DatabaseAdapter for MemoryAdapter {
    fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        Ok(Box::new(MemoryConnection {
            db: Arc::clone(&self.db),
            staged: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
        }))
    }

    fn schema(&self) -> &str {
        &self.schema
    }

    fn srid(&self) -> u32 {
        4326
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn max_in_operator_size(&self) -> usize {
        self.max_in_operator_size
    }
}

enum Staged {
    Delete(Vec<i64>),
    Terminate(Vec<(i64, [Option<String>; 3])>),
    InsertFeatures(Vec<StoredFeature>),
    InsertProperties(Vec<StoredProperty>),
}

struct MemoryConnection {
    db: Arc<MemoryDatabase>,
    staged: Mutex<Vec<Staged>>,
    /// Requêtes en cours sur cette connexion
    active: AtomicUsize,
}

fn bad_param(index: usize) -> DbError {
    DbError::new(format!("unexpected type for parameter ${}", index + 1))
}

fn ids(params: &[SqlParam], index: usize) -> Result<Vec<i64>, DbError> {
    match params.get(index) {
        Some(SqlParam::BigIntArray(v)) => Ok(v.iter().flatten().copied().collect()),
        _ => Err(bad_param(index)),
    }
}

fn bigints(params: &[SqlParam], index: usize) -> Result<&[Option<i64>], DbError> {
    match params.get(index) {
        Some(SqlParam::BigIntArray(v)) => Ok(v),
        _ => Err(bad_param(index)),
    }
}

fn texts(params: &[SqlParam], index: usize) -> Result<&[Option<String>], DbError> {
    match params.get(index) {
        Some(SqlParam::TextArray(v)) => Ok(v),
        _ => Err(bad_param(index)),
    }
}

fn doubles(params: &[SqlParam], index: usize) -> Result<&[Option<f64>], DbError> {
    match params.get(index) {
        Some(SqlParam::DoubleArray(v)) => Ok(v),
        _ => Err(bad_param(index)),
    }
}

fn jsons(params: &[SqlParam], index: usize) -> Result<&[Option<serde_json::Value>], DbError> {
    match params.get(index) {
        Some(SqlParam::JsonArray(v)) => Ok(v),
        _ => Err(bad_param(index)),
    }
}

fn envelope(bounds: [Option<f64>; 4]) -> Option<[f64; 4]> {
    match bounds {
        [Some(a), Some(b), Some(c), Some(d)] => Some([a, b, c, d]),
        _ => None,
    }
}

impl MemoryConnection {
    /// Encadre une requête et signale tout chevauchement
    fn exclusive<T>(&self, run: impl FnOnce() -> T) -> T {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.db.overlapped.store(true, Ordering::SeqCst);
        }
        std::thread::yield_now();
        let result = run();
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn stage(&self, statement: &Statement, params: &[SqlParam]) -> Result<u64, DbError> {
        let staged = match statement.kind {
            StatementKind::DeleteFeatures => Staged::Delete(ids(params, 0)?),
            StatementKind::TerminateFeatures => {
                let ids = bigints(params, 0)?;
                let (persons, reasons, lineages) = (texts(params, 1)?, texts(params, 2)?, texts(params, 3)?);
                Staged::Terminate(
                    ids.iter()
                        .enumerate()
                        .filter_map(|(i, id)| {
                            id.map(|id| {
                                (
                                    id,
                                    [
                                        persons.get(i).cloned().flatten(),
                                        reasons.get(i).cloned().flatten(),
                                        lineages.get(i).cloned().flatten(),
                                    ],
                                )
                            })
                        })
                        .collect(),
                )
            }
            StatementKind::InsertFeatures => {
                let ids = bigints(params, 0)?;
                let classes = texts(params, 1)?;
                let objectids = texts(params, 2)?;
                let identifiers = texts(params, 3)?;
                let bounds: Vec<&[Option<f64>]> =
                    (4..8).map(|i| doubles(params, i)).collect::<Result<_, _>>()?;
                let (persons, reasons, lineages) = (texts(params, 8)?, texts(params, 9)?, texts(params, 10)?);
                let contents = jsons(params, 11)?;

                let mut features = Vec::with_capacity(ids.len());
                for (i, id) in ids.iter().enumerate() {
                    let id = id.ok_or_else(|| DbError::with_sqlstate("null value in column \"id\"", "23502"))?;
                    let objectclass = classes.get(i).cloned().flatten().ok_or_else(|| {
                        DbError::with_sqlstate("null value in column \"objectclass\"", "23502")
                    })?;
                    features.push(StoredFeature {
                        id,
                        objectclass,
                        objectid: objectids.get(i).cloned().flatten(),
                        identifier: identifiers.get(i).cloned().flatten(),
                        envelope: envelope([
                            bounds[0].get(i).copied().flatten(),
                            bounds[1].get(i).copied().flatten(),
                            bounds[2].get(i).copied().flatten(),
                            bounds[3].get(i).copied().flatten(),
                        ]),
                        terminated: false,
                        updating_person: persons.get(i).cloned().flatten(),
                        reason_for_update: reasons.get(i).cloned().flatten(),
                        lineage: lineages.get(i).cloned().flatten(),
                        content: contents
                            .get(i)
                            .cloned()
                            .flatten()
                            .unwrap_or(serde_json::Value::Null),
                    });
                }
                Staged::InsertFeatures(features)
            }
            StatementKind::InsertProperties => {
                let feature_ids = bigints(params, 0)?;
                let names = texts(params, 1)?;
                let strings = texts(params, 2)?;
                let reals = doubles(params, 3)?;
                let ints = bigints(params, 4)?;
                let mut properties = Vec::with_capacity(feature_ids.len());
                for (i, feature_id) in feature_ids.iter().enumerate() {
                    let value = match (
                        strings.get(i).cloned().flatten(),
                        reals.get(i).copied().flatten(),
                        ints.get(i).copied().flatten(),
                    ) {
                        (Some(s), _, _) => SqlValue::Text(s),
                        (_, Some(d), _) => SqlValue::Double(d),
                        (_, _, Some(n)) => SqlValue::BigInt(n),
                        _ => SqlValue::Null,
                    };
                    properties.push(StoredProperty {
                        feature_id: feature_id.unwrap_or_default(),
                        name: names.get(i).cloned().flatten().unwrap_or_default(),
                        value,
                    });
                }
                Staged::InsertProperties(properties)
            }
            other => return Err(DbError::new(format!("{} is not a modification statement", other))),
        };

        let affected = match &staged {
            Staged::Delete(ids) => {
                let tables = self.db.tables.lock();
                ids.iter().filter(|id| tables.features.contains_key(*id)).count()
            }
            Staged::Terminate(rows) => rows.len(),
            Staged::InsertFeatures(rows) => rows.len(),
            Staged::InsertProperties(rows) => rows.len(),
        };
        self.staged.lock().push(staged);
        Ok(affected as u64)
    }
}

impl Connection for MemoryConnection {
    fn execute(&self, statement: &Statement, params: &[SqlParam]) -> Result<u64, DbError> {
        self.exclusive(|| {
            self.db.check(statement, params)?;
            self.stage(statement, params)
        })
    }

    fn query(&self, statement: &Statement, params: &[SqlParam]) -> Result<Vec<Row>, DbError> {
        self.exclusive(|| self.select(statement, params))
    }

    fn commit(&self) -> Result<(), DbError> {
        self.exclusive(|| self.apply_staged())
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.exclusive(|| {
            self.staged.lock().clear();
            self.db.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

impl MemoryConnection {
    fn select(&self, statement: &Statement, params: &[SqlParam]) -> Result<Vec<Row>, DbError> {
        self.db.check(statement, params)?;
        match statement.kind {
            StatementKind::ProbeObjectIds => {
                let wanted = texts(params, 0)?;
                let tables = self.db.tables.lock();
                Ok(tables
                    .features
                    .values()
                    .filter(|f| !f.terminated)
                    .filter(|f| f.objectid.is_some() && wanted.contains(&f.objectid))
                    .map(|f| vec![SqlValue::from(f.objectid.clone()), SqlValue::BigInt(f.id)])
                    .collect())
            }
            StatementKind::FetchFeatures => {
                let wanted = ids(params, 0)?;
                let tables = self.db.tables.lock();
                Ok(wanted
                    .iter()
                    .filter_map(|id| tables.features.get(id))
                    .map(|f| {
                        vec![
                            SqlValue::BigInt(f.id),
                            SqlValue::from(f.objectid.clone()),
                            SqlValue::Text(f.objectclass.clone()),
                            SqlValue::Text(f.content.to_string()),
                        ]
                    })
                    .collect())
            }
            StatementKind::ReserveIds => {
                let count = match params.first() {
                    Some(SqlParam::BigInt(n)) => *n,
                    _ => return Err(bad_param(0)),
                };
                Ok((0..count.max(0))
                    .map(|_| vec![SqlValue::BigInt(self.db.next_id())])
                    .collect())
            }
            StatementKind::SelectIds => {
                let after = match params.first() {
                    Some(SqlParam::BigInt(n)) => *n,
                    _ => return Err(bad_param(0)),
                };
                let limit = match params.get(1) {
                    Some(SqlParam::BigInt(n)) => usize::try_from(*n).unwrap_or(0),
                    _ => return Err(bad_param(1)),
                };
                let classes = match params.get(2) {
                    Some(SqlParam::TextArray(v)) => Some(v.as_slice()),
                    _ => None,
                };
                let tables = self.db.tables.lock();
                Ok(tables
                    .features
                    .range(after.saturating_add(1)..)
                    .map(|(_, f)| f)
                    .filter(|f| !f.terminated)
                    .filter(|f| classes.is_none_or(|c| c.contains(&Some(f.objectclass.clone()))))
                    .take(limit)
                    .map(|f| {
                        vec![
                            SqlValue::BigInt(f.id),
                            SqlValue::from(f.objectid.clone()),
                            SqlValue::Text(f.objectclass.clone()),
                        ]
                    })
                    .collect())
            }
            other => Err(DbError::new(format!("{} is not a query", other))),
        }
    }

    fn apply_staged(&self) -> Result<(), DbError> {
        let staged = std::mem::take(&mut *self.staged.lock());
        if self.db.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::with_sqlstate("injected commit failure", "40001"));
        }

        let mut tables = self.db.tables.lock();
        let mut next = Tables {
            features: tables.features.clone(),
            properties: tables.properties.clone(),
        };
        for change in staged {
            match change {
                Staged::Delete(ids) => {
                    for id in &ids {
                        next.features.remove(id);
                    }
                    next.properties.retain(|p| !ids.contains(&p.feature_id));
                }
                Staged::Terminate(rows) => {
                    for (id, [person, reason, lineage]) in rows {
                        if let Some(feature) = next.features.get_mut(&id).filter(|f| !f.terminated) {
                            feature.terminated = true;
                            feature.updating_person = person.or(feature.updating_person.take());
                            feature.reason_for_update = reason.or(feature.reason_for_update.take());
                            feature.lineage = lineage.or(feature.lineage.take());
                        }
                    }
                }
                Staged::InsertFeatures(rows) => {
                    for feature in rows {
                        if next.features.contains_key(&feature.id) {
                            return Err(DbError::with_sqlstate(
                                format!("duplicate key value (id)=({})", feature.id),
                                "23505",
                            ));
                        }
                        next.features.insert(feature.id, feature);
                    }
                }
                Staged::InsertProperties(rows) => next.properties.extend(rows),
            }
        }

        if let Some(orphan) = next
            .properties
            .iter()
            .find(|p| !next.features.contains_key(&p.feature_id))
        {
            return Err(DbError::with_sqlstate(
                format!("property references missing feature {}", orphan.feature_id),
                "23503",
            ));
        }

        *tables = next;
        self.db.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
