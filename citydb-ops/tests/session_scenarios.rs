//! Scénarios de sessions sur la base en mémoire

use std::sync::Arc;

use citydb_ops::batch::{BatchWriter, TableKind};
use citydb_ops::testing::{MemoryAdapter, MemoryDatabase};
use citydb_ops::{
    AttributeValue, CityFeature, Command, DeleteCommand, DeleteItem, DeleteMode, Deleter, Envelope,
    ExportCommand, ExportedFeature, Exporter, FeatureSink, ImportCommand, Importer, Metadata, OpsError,
    Result, SessionOptions, SessionState, SqlParam, StatementKind, TransactionMode, WorkerContext,
    WriterEnv, WriterFactory,
};
use parking_lot::Mutex;

/// Commande de suppression qui échoue pour un identifiant donné
struct FailingDelete {
    inner: DeleteCommand,
    fail_on: i64,
}

impl WriterFactory for FailingDelete {
    fn create_writer(&self, kind: TableKind, env: &WriterEnv) -> Result<Box<dyn BatchWriter>> {
        self.inner.create_writer(kind, env)
    }
}

impl Command for FailingDelete {
    type Item = DeleteItem;
    type Output = ();

    fn name(&self) -> &'static str {
        "failing-delete"
    }

    fn apply(&self, ctx: &mut WorkerContext, item: DeleteItem) -> Result<()> {
        if item.id == self.fail_on {
            return Err(OpsError::invalid_feature(item.id.to_string(), "rejected by command"));
        }
        self.inner.apply(ctx, item)
    }
}

/// Import qui écrit toutes les lignes d'un élément puis échoue sur un objectid donné
struct FailingImport {
    inner: ImportCommand,
    fail_on: &'static str,
}

impl WriterFactory for FailingImport {
    fn create_writer(&self, kind: TableKind, env: &WriterEnv) -> Result<Box<dyn BatchWriter>> {
        self.inner.create_writer(kind, env)
    }
}

impl Command for FailingImport {
    type Item = CityFeature;
    type Output = i64;

    fn name(&self) -> &'static str {
        "failing-import"
    }

    fn apply(&self, ctx: &mut WorkerContext, item: CityFeature) -> Result<i64> {
        let rejected = item.objectid.as_deref() == Some(self.fail_on);
        let id = self.inner.apply(ctx, item)?;
        if rejected {
            return Err(OpsError::invalid_feature(id.to_string(), "rejected after write"));
        }
        Ok(id)
    }
}

/// Feature avec trois attributs, donc trois lignes `property`
fn three_attributes(objectid: String) -> CityFeature {
    let mut feature = CityFeature::new(objectid, "Building");
    for (name, value) in [("storeys", 3), ("rooms", 12), ("doors", 2)] {
        feature
            .attributes
            .insert(name.into(), AttributeValue::Int(value));
    }
    feature
}

fn seeded(count: usize) -> (Arc<MemoryDatabase>, Vec<i64>) {
    let db = Arc::new(MemoryDatabase::new());
    let ids = (0..count)
        .map(|i| db.insert_feature(&format!("bldg-{}", i), "Building"))
        .collect();
    (db, ids)
}

fn single_thread(batch_size: usize) -> SessionOptions {
    SessionOptions::default()
        .threads(1)
        .batch_size(batch_size)
        .keep_log_entries(true)
}

#[test]
fn test_scenario_a_two_flushes_then_commit() {
    let db = Arc::new(MemoryDatabase::new());
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let deleter = Deleter::new(DeleteCommand::default());
    deleter.start(&adapter, single_thread(2)).unwrap();

    let handles: Vec<_> = [101, 102, 103]
        .into_iter()
        .map(|id| deleter.submit(DeleteItem::new(id)))
        .collect();

    assert_eq!(deleter.commit_session().unwrap(), SessionState::Committed);
    for handle in handles {
        handle.wait().unwrap();
    }

    assert_eq!(db.executions_of(StatementKind::DeleteFeatures), vec![2, 1]);
    assert_eq!(deleter.state(), SessionState::Committed);
    assert!(deleter.was_successful());
    let stats = deleter.statistics();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.committed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(db.commit_count(), 1);
}

#[test]
fn test_scenario_b_failed_item_aborts_session() {
    let db = Arc::new(MemoryDatabase::new());
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let session = citydb_ops::Session::new(FailingDelete {
        inner: DeleteCommand::default(),
        fail_on: 102,
    });
    session.start(&adapter, single_thread(2)).unwrap();

    let handles: Vec<_> = [101, 102, 103]
        .into_iter()
        .map(|id| session.submit(DeleteItem::new(id)))
        .collect();

    let err = session.commit_session().unwrap_err();
    assert!(matches!(err, OpsError::InvalidFeature { .. }));
    assert_eq!(session.state(), SessionState::Aborted);
    assert!(!session.was_successful());
    assert!(matches!(
        session.first_failure(),
        Some(OpsError::InvalidFeature { ref id, .. }) if id == "102"
    ));

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.wait()).collect();
    assert!(outcomes[0].is_ok());
    assert!(outcomes[1].is_err());

    let log = session.log().unwrap();
    assert_eq!(log.committed_count(), 0);
    assert!(log.committed_entries().is_empty());
    assert_eq!(db.commit_count(), 0);
}

#[test]
fn test_database_failure_aborts_and_keeps_rows() {
    let (db, ids) = seeded(6);
    let poisoned = ids[4];
    db.fail_when(StatementKind::DeleteFeatures, move |params| {
        matches!(&params[0], SqlParam::BigIntArray(batch) if batch.contains(&Some(poisoned)))
    });
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let deleter = Deleter::new(DeleteCommand::default());
    deleter.start(&adapter, single_thread(2)).unwrap();

    for id in &ids {
        deleter.submit(DeleteItem::new(*id));
    }

    assert!(matches!(deleter.commit_session(), Err(OpsError::Database(_))));
    assert_eq!(deleter.state(), SessionState::Aborted);
    assert_eq!(db.live_ids(), ids);
}

#[test]
fn test_all_handles_resolve_with_many_workers() {
    let (db, ids) = seeded(500);
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let deleter = Deleter::new(DeleteCommand::default());
    deleter
        .start(&adapter, SessionOptions::default().threads(4).batch_size(7))
        .unwrap();

    let handles: Vec<_> = ids.iter().map(|id| deleter.submit(DeleteItem::new(*id))).collect();
    assert_eq!(deleter.commit_session().unwrap(), SessionState::Committed);

    assert!(handles.into_iter().all(|h| h.wait().is_ok()));
    assert!(db.live_ids().is_empty());
    assert_eq!(deleter.statistics().committed, 500);
    let flushed: usize = db.executions_of(StatementKind::DeleteFeatures).iter().sum();
    assert_eq!(flushed, 500);
    assert!(db
        .executions_of(StatementKind::DeleteFeatures)
        .iter()
        .all(|&rows| rows <= 7));
}

#[test]
fn test_submit_rejected_outside_started_state() {
    let db = Arc::new(MemoryDatabase::new());
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let deleter = Deleter::new(DeleteCommand::default());

    assert!(matches!(
        deleter.submit(DeleteItem::new(1)).wait(),
        Err(OpsError::NotAllowed(SessionState::NotStarted))
    ));

    deleter.start(&adapter, single_thread(10)).unwrap();
    deleter.commit_session().unwrap();
    assert!(matches!(
        deleter.submit(DeleteItem::new(1)).wait(),
        Err(OpsError::NotAllowed(SessionState::Committed))
    ));
    assert!(matches!(
        deleter.start(&adapter, single_thread(10)),
        Err(OpsError::AlreadyFinished(SessionState::Committed))
    ));
}

#[test]
fn test_terminal_transitions_are_idempotent() {
    let db = Arc::new(MemoryDatabase::new());
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let deleter = Deleter::new(DeleteCommand::default());

    assert!(matches!(deleter.commit_session(), Err(OpsError::NotStarted)));

    deleter.start(&adapter, single_thread(10)).unwrap();
    deleter.start(&adapter, single_thread(10)).unwrap();
    assert_eq!(deleter.abort_session().unwrap(), SessionState::Aborted);
    assert_eq!(deleter.abort_session().unwrap(), SessionState::Aborted);
    assert_eq!(deleter.commit_session().unwrap(), SessionState::Aborted);
    assert!(deleter.was_successful());
}

#[test]
fn test_abort_without_work() {
    let deleter = Deleter::new(DeleteCommand::default());
    assert_eq!(deleter.abort_session().unwrap(), SessionState::Aborted);
    assert_eq!(deleter.statistics().submitted, 0);
}

#[test]
fn test_abort_discards_pending_batches() {
    let (db, ids) = seeded(5);
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let deleter = Deleter::new(DeleteCommand::default());
    deleter.start(&adapter, single_thread(2)).unwrap();
    for id in &ids {
        deleter.submit(DeleteItem::new(*id));
    }

    assert_eq!(deleter.abort_session().unwrap(), SessionState::Aborted);
    assert_eq!(db.live_ids(), ids);
    assert_eq!(db.executions_of(StatementKind::DeleteFeatures), vec![2, 2]);
    assert_eq!(deleter.statistics().rolled_back, 4);
}

#[test]
fn test_preview_rolls_back_but_succeeds() {
    let (db, ids) = seeded(3);
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let deleter = Deleter::new(DeleteCommand::default());
    deleter
        .start(
            &adapter,
            single_thread(10).transaction_mode(TransactionMode::AutoRollback),
        )
        .unwrap();
    for id in &ids {
        deleter.submit(DeleteItem::new(*id));
    }

    assert_eq!(deleter.commit_session().unwrap(), SessionState::Aborted);
    assert!(deleter.was_successful());
    assert_eq!(db.live_ids(), ids);
    let stats = deleter.statistics();
    assert_eq!(stats.committed, 0);
    assert_eq!(stats.rolled_back, 3);
}

#[test]
fn test_auto_commit_keeps_committed_checkpoints_after_failure() {
    let (db, ids) = seeded(6);
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let session = citydb_ops::Session::new(FailingDelete {
        inner: DeleteCommand::default(),
        fail_on: ids[4],
    });
    session
        .start(
            &adapter,
            single_thread(10).transaction_mode(TransactionMode::AutoCommit(2)),
        )
        .unwrap();
    for id in &ids {
        let _ = session.submit(DeleteItem::new(*id)).wait();
    }

    assert!(session.commit_session().is_err());
    assert_eq!(session.state(), SessionState::Aborted);
    // Deux checkpoints avant l'échec: quatre suppressions commitées
    assert_eq!(db.live_ids(), vec![ids[4], ids[5]]);
    assert_eq!(session.statistics().committed, 4);
    assert_eq!(db.commit_count(), 2);
}

#[test]
fn test_auto_commit_import_with_many_workers() {
    for _ in 0..5 {
        let db = Arc::new(MemoryDatabase::new());
        let adapter = MemoryAdapter::new(Arc::clone(&db));
        let importer = Importer::new(ImportCommand::new(Metadata::default()));
        importer
            .start(
                &adapter,
                SessionOptions::default()
                    .threads(4)
                    .batch_size(4)
                    .transaction_mode(TransactionMode::AutoCommit(3)),
            )
            .unwrap();
        for i in 0..400 {
            importer.submit(three_attributes(format!("b{}", i)));
        }

        assert_eq!(importer.commit_session().unwrap(), SessionState::Committed);
        let features = db.features();
        assert_eq!(features.len(), 400);
        assert!(features.iter().all(|f| db.properties_of(f.id).len() == 3));
        // 133 checkpoints puis le commit final
        assert_eq!(db.commit_count(), 134);
        assert_eq!(importer.statistics().committed, 400);
        assert!(!db.saw_overlapping_statements());
    }
}

#[test]
fn test_checkpoint_never_commits_a_failing_item() {
    for _ in 0..5 {
        let db = Arc::new(MemoryDatabase::new());
        let adapter = MemoryAdapter::new(Arc::clone(&db));
        let session = citydb_ops::Session::new(FailingImport {
            inner: ImportCommand::new(Metadata::default()),
            fail_on: "b50",
        });
        session
            .start(
                &adapter,
                SessionOptions::default()
                    .threads(4)
                    .batch_size(1)
                    .transaction_mode(TransactionMode::AutoCommit(1)),
            )
            .unwrap();
        let handles: Vec<_> = (0..200)
            .map(|i| session.submit(three_attributes(format!("b{}", i))))
            .collect();
        for handle in handles {
            let _ = handle.wait();
        }

        assert!(session.commit_session().is_err());
        assert_eq!(session.state(), SessionState::Aborted);
        let features = db.features();
        assert!(features.iter().all(|f| f.objectid.as_deref() != Some("b50")));
        assert!(features.iter().all(|f| db.properties_of(f.id).len() == 3));
        assert!(features.len() < 200);
    }
}

#[test]
fn test_terminate_keeps_history() {
    let (db, ids) = seeded(2);
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let metadata = Metadata {
        updating_person: Some("ops".into()),
        reason_for_update: Some("superseded".into()),
        lineage: None,
    };
    let deleter = Deleter::new(DeleteCommand::new(DeleteMode::Terminate, metadata));
    deleter.start(&adapter, single_thread(10)).unwrap();
    deleter.submit(DeleteItem::new(ids[0]));
    deleter.commit_session().unwrap();

    let terminated = db.feature(ids[0]).unwrap();
    assert!(terminated.terminated);
    assert_eq!(terminated.updating_person.as_deref(), Some("ops"));
    assert!(!db.feature(ids[1]).unwrap().terminated);
    assert_eq!(db.live_ids(), vec![ids[1]]);
}

#[test]
fn test_import_assigns_ids_and_properties() {
    let db = Arc::new(MemoryDatabase::new());
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let importer = Importer::new(ImportCommand::new(Metadata::default()));
    importer
        .start(&adapter, SessionOptions::default().threads(2).batch_size(3))
        .unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let mut feature = CityFeature::new(format!("b{}", i), "Building");
            feature.envelope = Some(Envelope {
                min: [0.0, 0.0, 0.0],
                max: [1.0, 2.0, 3.0],
            });
            feature
                .attributes
                .insert("storeys".into(), AttributeValue::Int(i));
            importer.submit(feature)
        })
        .collect();
    assert_eq!(importer.commit_session().unwrap(), SessionState::Committed);

    let mut assigned: Vec<i64> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
    assigned.sort_unstable();
    assigned.dedup();
    assert_eq!(assigned.len(), 10);

    let features = db.features();
    assert_eq!(features.len(), 10);
    assert!(features.iter().all(|f| f.envelope == Some([0.0, 0.0, 1.0, 2.0])));
    for id in assigned {
        assert_eq!(db.properties_of(id).len(), 1);
    }
    assert_eq!(importer.statistics().by_class.get("Building"), Some(&10));
}

#[test]
fn test_import_rejects_feature_without_class() {
    let db = Arc::new(MemoryDatabase::new());
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let importer = Importer::new(ImportCommand::default());
    importer.start(&adapter, single_thread(10)).unwrap();

    let bad = importer.submit(CityFeature::new("x", " "));
    assert!(matches!(bad.wait(), Err(OpsError::InvalidFeature { .. })));
    assert!(importer.commit_session().is_err());
    assert!(db.features().is_empty());
}

#[derive(Default)]
struct CollectingSink {
    features: Mutex<Vec<ExportedFeature>>,
}

impl FeatureSink for CollectingSink {
    fn write(&self, feature: ExportedFeature) -> Result<()> {
        self.features.lock().push(feature);
        Ok(())
    }
}

#[test]
fn test_export_sends_every_feature_to_sink() {
    let (db, ids) = seeded(25);
    let adapter = MemoryAdapter::new(Arc::clone(&db));
    let sink = Arc::new(CollectingSink::default());
    let exporter = Exporter::new(ExportCommand::new(sink.clone()));
    exporter
        .start(&adapter, SessionOptions::default().threads(3).batch_size(4))
        .unwrap();
    for id in &ids {
        exporter.submit(*id);
    }
    assert_eq!(exporter.commit_session().unwrap(), SessionState::Committed);

    let mut exported: Vec<i64> = sink.features.lock().iter().map(|f| f.id).collect();
    exported.sort_unstable();
    assert_eq!(exported, ids);
    assert_eq!(exporter.statistics().committed, 25);
}
