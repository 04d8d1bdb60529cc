//! Scénarios de détection des doublons sur la base en mémoire

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use citydb_ops::testing::{MemoryAdapter, MemoryDatabase};
use citydb_ops::{
    CacheBackend, CityFeature, DuplicateController, DuplicateMode, DuplicateOptions, FileDecision,
    ImportCommand, Importer, OpsError, Result, SessionOptions, StatementKind, TypeFilter,
};

fn database(objectids: &[&str]) -> Arc<MemoryDatabase> {
    let db = Arc::new(MemoryDatabase::new());
    for objectid in objectids {
        db.insert_feature(objectid, "Building");
    }
    db
}

fn file(objectids: &[&str]) -> Vec<Result<CityFeature>> {
    objectids
        .iter()
        .map(|objectid| Ok(CityFeature::new(*objectid, "Building")))
        .collect()
}

fn controller(db: &Arc<MemoryDatabase>, mode: DuplicateMode) -> DuplicateController {
    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(db)));
    DuplicateController::new(
        adapter,
        DuplicateOptions {
            mode,
            threads: Some(2),
            ..Default::default()
        },
    )
}

/// Importe les features non dupliquées, retourne les objectids transmis
fn import_filtered(
    db: &Arc<MemoryDatabase>,
    controller: &DuplicateController,
    features: Vec<Result<CityFeature>>,
) -> Vec<String> {
    let adapter = MemoryAdapter::new(Arc::clone(db));
    let importer = Importer::new(ImportCommand::default());
    importer
        .start(&adapter, SessionOptions::default().threads(2))
        .unwrap();

    let mut forwarded = Vec::new();
    for feature in features {
        let feature = feature.unwrap();
        if controller.is_duplicate(&feature).unwrap() {
            continue;
        }
        forwarded.push(feature.label().to_string());
        importer.submit(feature);
    }
    importer.commit_session().unwrap();
    forwarded
}

#[test]
fn test_scenario_c_partial_duplicates_accept_file() {
    let db = database(&["a", "c"]);
    let mut controller = controller(&db, DuplicateMode::SkipExisting);

    let decision = controller
        .process_duplicates(file(&["a", "b", "c"]), &TypeFilter::all())
        .unwrap();
    assert_eq!(decision, FileDecision::AcceptFile);
    assert_eq!(controller.counts().features, 3);
    assert_eq!(controller.counts().in_database, 2);

    let forwarded = import_filtered(&db, &controller, file(&["a", "b", "c"]));
    assert_eq!(forwarded, vec!["b".to_string()]);
    assert_eq!(db.features().len(), 3);
}

#[test]
fn test_scenario_d_all_duplicates_skip_file() {
    let db = database(&["a", "c"]);
    let mut controller = controller(&db, DuplicateMode::SkipExisting);

    let decision = controller
        .process_duplicates(file(&["a", "c"]), &TypeFilter::all())
        .unwrap();
    assert_eq!(decision, FileDecision::SkipFile);
    assert!(db.executions_of(StatementKind::InsertFeatures).is_empty());
    assert!(db.executions_of(StatementKind::DeleteFeatures).is_empty());
}

#[test]
fn test_empty_file_is_accepted() {
    let db = database(&["a"]);
    let mut controller = controller(&db, DuplicateMode::SkipExisting);
    let decision = controller
        .process_duplicates(Vec::new(), &TypeFilter::all())
        .unwrap();
    assert_eq!(decision, FileDecision::AcceptFile);
    assert_eq!(controller.counts().features, 0);
}

#[test]
fn test_repeated_objectids_in_file() {
    let db = database(&["a"]);
    let mut controller = controller(&db, DuplicateMode::SkipExisting);
    let features = ["a", "a", "b", "b", "d"];

    let decision = controller
        .process_duplicates(file(&features), &TypeFilter::all())
        .unwrap();
    assert_eq!(decision, FileDecision::AcceptFile);
    let counts = controller.counts();
    assert_eq!(counts.in_file, 2);
    assert_eq!(counts.distinct, 3);
    assert_eq!(counts.in_database, 2);
    assert_eq!(counts.distinct_in_database, 1);
    // Chaque objectid n'est interrogé qu'une fois
    let probed: usize = db.executions_of(StatementKind::ProbeObjectIds).iter().sum();
    assert_eq!(probed, 3);

    let forwarded = import_filtered(&db, &controller, file(&features));
    assert_eq!(forwarded, vec!["b".to_string(), "d".to_string()]);
}

#[test]
fn test_type_filter_limits_candidates() {
    let db = database(&["a"]);
    let mut controller = controller(&db, DuplicateMode::SkipExisting);
    let features = vec![
        Ok(CityFeature::new("a", "Building")),
        Ok(CityFeature::new("r", "Road")),
    ];
    let decision = controller
        .process_duplicates(features, &TypeFilter::new(["Building"]))
        .unwrap();
    assert_eq!(decision, FileDecision::SkipFile);
    assert_eq!(controller.counts().features, 1);
}

fn confirmed_sets(threads: usize, max_in: usize) -> (BTreeSet<String>, BTreeSet<i64>) {
    let db = Arc::new(MemoryDatabase::new());
    let existing: Vec<String> = (0..300).map(|i| format!("obj-{}", i * 3)).collect();
    for objectid in &existing {
        db.insert_feature(objectid, "Building");
    }
    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&db)).with_max_in_operator_size(max_in));
    let mut controller = DuplicateController::new(
        adapter,
        DuplicateOptions {
            threads: Some(threads),
            ..Default::default()
        },
    );
    let features: Vec<Result<CityFeature>> = (0..1000)
        .map(|i| Ok(CityFeature::new(format!("obj-{}", i), "Building")))
        .collect();
    controller
        .process_duplicates(features, &TypeFilter::all())
        .unwrap();

    let cache = controller.cache().unwrap();
    let objectids = cache.confirmed_objectids().unwrap();
    let mut ids = BTreeSet::new();
    cache
        .for_each_confirmed(&mut |id, _| {
            ids.insert(id);
            true
        })
        .unwrap();
    (objectids, ids)
}

#[test]
fn test_single_and_multi_threaded_runs_agree() {
    let (single_objectids, single_ids) = confirmed_sets(1, 37);
    let (multi_objectids, multi_ids) = confirmed_sets(4, 37);
    assert_eq!(single_objectids.len(), 300);
    assert_eq!(single_objectids, multi_objectids);
    assert_eq!(single_ids, multi_ids);
}

fn disk_controller(db: &Arc<MemoryDatabase>, mode: DuplicateMode, base: &Path) -> DuplicateController {
    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(db)));
    DuplicateController::new(
        adapter,
        DuplicateOptions {
            mode,
            threads: Some(2),
            backend: CacheBackend::Disk {
                base_dir: Some(base.to_path_buf()),
            },
            ..Default::default()
        },
    )
}

#[test]
fn test_lookup_failure_closes_cache() {
    let base = tempfile::tempdir().unwrap();
    let db = database(&["a"]);
    db.fail_when(StatementKind::ProbeObjectIds, |_| true);
    let mut controller = disk_controller(&db, DuplicateMode::SkipExisting, base.path());

    let err = controller
        .process_duplicates(file(&["a", "b"]), &TypeFilter::all())
        .unwrap_err();
    assert!(matches!(err, OpsError::Database(_)));
    assert!(controller.cache().is_none());
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    assert!(matches!(
        controller.is_duplicate(&CityFeature::new("b", "Building")),
        Err(OpsError::Cache(_))
    ));
}

#[test]
fn test_removal_failure_closes_cache() {
    let base = tempfile::tempdir().unwrap();
    let db = database(&["a", "b"]);
    db.fail_when(StatementKind::DeleteFeatures, |_| true);
    let mut controller = disk_controller(&db, DuplicateMode::DeleteExisting, base.path());

    assert!(controller
        .process_duplicates(file(&["a", "b", "c"]), &TypeFilter::all())
        .is_err());
    assert!(controller.cache().is_none());
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    assert_eq!(db.live_ids().len(), 2);
}

#[test]
fn test_detection_connection_is_released() {
    let db = database(&["a"]);
    let mut controller = controller(&db, DuplicateMode::SkipExisting);
    let before = db.rollback_count();

    controller
        .process_duplicates(file(&["a", "b"]), &TypeFilter::all())
        .unwrap();
    assert_eq!(db.rollback_count(), before + 1);

    db.fail_when(StatementKind::ProbeObjectIds, |_| true);
    assert!(controller
        .process_duplicates(file(&["a"]), &TypeFilter::all())
        .is_err());
    assert_eq!(db.rollback_count(), before + 2);
}

#[test]
fn test_reader_failure_stops_detection() {
    let db = database(&["a"]);
    let mut controller = controller(&db, DuplicateMode::SkipExisting);
    let features = vec![
        Ok(CityFeature::new("a", "Building")),
        Err(OpsError::Reader("truncated line 2".into())),
        Ok(CityFeature::new("b", "Building")),
    ];
    let err = controller
        .process_duplicates(features, &TypeFilter::all())
        .unwrap_err();
    assert!(matches!(err, OpsError::Reader(_)));
}

#[test]
fn test_delete_existing_removes_rows() {
    let db = database(&["a", "c", "z"]);
    let mut controller = controller(&db, DuplicateMode::DeleteExisting);

    let decision = controller
        .process_duplicates(file(&["a", "b", "c"]), &TypeFilter::all())
        .unwrap();
    assert_eq!(decision, FileDecision::AcceptFile);
    assert_eq!(controller.counts().removed, 2);

    let remaining: Vec<String> = db.features().into_iter().filter_map(|f| f.objectid).collect();
    assert_eq!(remaining, vec!["z".to_string()]);

    let forwarded = import_filtered(&db, &controller, file(&["a", "b", "c"]));
    assert_eq!(forwarded.len(), 3);
}

#[test]
fn test_terminate_existing_preview_changes_nothing() {
    let db = database(&["a", "c"]);
    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&db)));
    let mut controller = DuplicateController::new(
        adapter,
        DuplicateOptions {
            mode: DuplicateMode::TerminateExisting,
            preview: true,
            threads: Some(1),
            ..Default::default()
        },
    );

    let decision = controller
        .process_duplicates(file(&["a", "c"]), &TypeFilter::all())
        .unwrap();
    assert_eq!(decision, FileDecision::AcceptFile);
    assert_eq!(controller.counts().removed, 0);
    assert_eq!(controller.counts().removal_previewed, 2);
    assert_eq!(db.live_ids().len(), 2);
    assert_eq!(db.executions_of(StatementKind::TerminateFeatures), vec![2]);
}

#[test]
fn test_disk_cache_matches_memory_and_is_removed() {
    let base = tempfile::tempdir().unwrap();
    let db = database(&["a", "c"]);
    let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&db)));
    let mut controller = DuplicateController::new(
        adapter,
        DuplicateOptions {
            backend: CacheBackend::Disk {
                base_dir: Some(base.path().to_path_buf()),
            },
            ..Default::default()
        },
    );

    let decision = controller
        .process_duplicates(file(&["a", "b", "c"]), &TypeFilter::all())
        .unwrap();
    assert_eq!(decision, FileDecision::AcceptFile);
    let path = controller.cache().unwrap().path().unwrap().to_path_buf();
    assert!(path.exists());

    let decision = controller
        .process_duplicates(file(&["a", "c"]), &TypeFilter::all())
        .unwrap();
    assert_eq!(decision, FileDecision::SkipFile);
    assert!(!path.exists());

    drop(controller);
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
}

#[test]
fn test_is_duplicate_requires_a_pass() {
    let db = database(&[]);
    let controller = controller(&db, DuplicateMode::SkipExisting);
    assert!(matches!(
        controller.is_duplicate(&CityFeature::new("a", "Building")),
        Err(OpsError::Cache(_))
    ));
    let mut anonymous = CityFeature::new("a", "Building");
    anonymous.objectid = None;
    assert!(!controller.is_duplicate(&anonymous).unwrap());
}
