//! Définition et implémentation des commandes CLI
//!
//! - `import`: CityJSON Sequence → base, un fichier = une session
//! - `export`: base → CityJSON Sequence
//! - `delete`: suppression ou terminaison de features
//!
//! Les sessions du moteur bloquent leur thread: elles sont pilotées depuis
//! `tokio::task::spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use citydb_ops::{
    write_entries_csv, CacheBackend, Command, DatabaseAdapter, DeleteCommand, DeleteItem, DeleteMode,
    Deleter, DuplicateController, DuplicateMode, DuplicateOptions, ExportCommand, Exporter,
    FeatureRef, FeatureSink, FileDecision, IdCursor, ImportCommand, Importer, LogEntry, Metadata,
    OperationLog, Session, SessionOptions, SessionState, TransactionMode, TypeFilter,
};
use clap::{Args, Subcommand, ValueEnum};
use deadpool_postgres::Pool;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::adapter::{create_pool, schema, test_connection, DatabaseConfig, PostgresAdapter};
use crate::config::{Config, DatabaseSection, SessionSection};
use crate::io::{collect_inputs, compute_file_checksum, file_key, input_root, CityJsonSeqReader, CityJsonSeqWriter};
use crate::report::{OperationReport, OperationStatus};

/// SRID utilisé quand ni la base ni la configuration n'en fournissent
pub const DEFAULT_SRID: u32 = 4326;

const CURSOR_PAGE_SIZE: usize = 10_000;

/// Options de connexion communes
#[derive(Args, Debug, Clone, Default)]
pub struct DatabaseArgs {
    /// PostgreSQL host (défaut : env PGHOST / localhost)
    #[arg(long)]
    pub host: Option<String>,

    /// PostgreSQL port (défaut : env PGPORT / 5432)
    #[arg(long)]
    pub port: Option<u16>,

    /// PostgreSQL database name (défaut : env PGDATABASE / citydb)
    #[arg(long)]
    pub database: Option<String>,

    /// PostgreSQL user (défaut : env PGUSER / postgres)
    #[arg(long)]
    pub user: Option<String>,

    /// PostgreSQL password (défaut : env PGPASSWORD)
    #[arg(long)]
    pub password: Option<String>,

    /// SSL mode: disable, prefer, require (défaut : env PGSSLMODE / disable)
    #[arg(long)]
    pub ssl: Option<String>,

    /// Target schema (défaut : env CITYDB_SCHEMA / citydb)
    #[arg(long)]
    pub schema: Option<String>,
}

impl DatabaseArgs {
    fn section(&self) -> DatabaseSection {
        DatabaseSection {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            ssl: self.ssl.clone(),
            schema: self.schema.clone(),
            pool_size: None,
        }
    }
}

/// Options de session communes
#[derive(Args, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Number of worker threads (default: max(2, available CPUs))
    #[arg(long)]
    pub threads: Option<usize>,

    /// Rows buffered per worker and table before a flush
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Commit every N processed features instead of once at the end
    #[arg(long)]
    pub commit_every: Option<u64>,

    /// Run everything, then roll back
    #[arg(long)]
    pub preview: bool,
}

impl SessionArgs {
    fn options(&self, defaults: &SessionSection, keep_log_entries: bool) -> SessionOptions {
        let transaction_mode = if self.preview {
            TransactionMode::AutoRollback
        } else {
            match self.commit_every.or(defaults.commit_every) {
                Some(n) if n > 0 => TransactionMode::AutoCommit(n),
                _ => TransactionMode::Manual,
            }
        };
        SessionOptions {
            threads: self.threads.or(defaults.threads),
            batch_size: self.batch_size.or(defaults.batch_size),
            queue_capacity: None,
            transaction_mode,
            keep_log_entries,
        }
    }
}

/// Métadonnées de mise à jour
#[derive(Args, Debug, Clone, Default)]
pub struct MetadataArgs {
    /// Person responsible for the change
    #[arg(long)]
    pub updating_person: Option<String>,

    /// Reason for the change
    #[arg(long = "reason")]
    pub reason_for_update: Option<String>,

    /// Data lineage
    #[arg(long)]
    pub lineage: Option<String>,
}

impl From<&MetadataArgs> for Metadata {
    fn from(args: &MetadataArgs) -> Self {
        Self {
            updating_person: args.updating_person.clone(),
            reason_for_update: args.reason_for_update.clone(),
            lineage: args.lineage.clone(),
        }
    }
}

/// Traitement des features déjà en base
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DuplicatesArg {
    /// No duplicate detection
    None,
    /// Skip features that already exist, skip files where all of them exist
    Skip,
    /// Delete existing features before import
    Delete,
    /// Terminate existing features before import
    Terminate,
}

impl DuplicatesArg {
    fn mode(self) -> Option<DuplicateMode> {
        match self {
            Self::None => None,
            Self::Skip => Some(DuplicateMode::SkipExisting),
            Self::Delete => Some(DuplicateMode::DeleteExisting),
            Self::Terminate => Some(DuplicateMode::TerminateExisting),
        }
    }
}

/// Stockage du cache de détection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheArg {
    Memory,
    Disk,
}

/// Suppression physique ou terminaison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DeleteModeArg {
    #[default]
    Delete,
    Terminate,
}

impl From<DeleteModeArg> for DeleteMode {
    fn from(arg: DeleteModeArg) -> Self {
        match arg {
            DeleteModeArg::Delete => DeleteMode::Delete,
            DeleteModeArg::Terminate => DeleteMode::Terminate,
        }
    }
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// CityJSON Sequence file, directory or glob pattern
    #[arg(short, long)]
    pub path: String,

    /// Only import these object classes (repeatable)
    #[arg(long = "type-name")]
    pub type_names: Vec<String>,

    /// Handling of features already in the database (défaut : config / none)
    #[arg(long, value_enum)]
    pub duplicates: Option<DuplicatesArg>,

    /// Duplicate detection cache (défaut : config / memory)
    #[arg(long, value_enum)]
    pub cache: Option<CacheArg>,

    /// Directory for the disk cache
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Skip files whose checksum matches a previous import
    #[arg(long)]
    pub skip_imported: bool,

    /// SRID of the envelope column when the schema is created (default: 4326)
    #[arg(long)]
    pub srid: Option<u32>,

    /// Drop schema before import
    #[arg(long)]
    pub drop_schema: bool,

    /// CSV file listing the committed features
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// JSON report file
    #[arg(long)]
    pub report: Option<PathBuf>,

    #[command(flatten)]
    pub metadata: MetadataArgs,

    #[command(flatten)]
    pub session: SessionArgs,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Output CityJSON Sequence file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Only export these object classes (repeatable)
    #[arg(long = "type-name")]
    pub type_names: Vec<String>,

    /// Export these database ids (repeatable)
    #[arg(long = "id")]
    pub ids: Vec<i64>,

    /// Export these objectids (repeatable)
    #[arg(long = "objectid")]
    pub objectids: Vec<String>,

    /// Number of worker threads
    #[arg(long)]
    pub threads: Option<usize>,

    /// Features fetched per query
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// JSON report file
    #[arg(long)]
    pub report: Option<PathBuf>,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Delete these database ids (repeatable)
    #[arg(long = "id")]
    pub ids: Vec<i64>,

    /// Delete these objectids (repeatable)
    #[arg(long = "objectid")]
    pub objectids: Vec<String>,

    /// Only delete these object classes (repeatable)
    #[arg(long = "type-name")]
    pub type_names: Vec<String>,

    /// Delete every feature when no other selector is given
    #[arg(long)]
    pub all: bool,

    /// delete removes rows, terminate sets their termination date
    #[arg(long, value_enum, default_value_t = DeleteModeArg::Delete)]
    pub mode: DeleteModeArg,

    /// CSV file listing the committed features
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// JSON report file
    #[arg(long)]
    pub report: Option<PathBuf>,

    #[command(flatten)]
    pub metadata: MetadataArgs,

    #[command(flatten)]
    pub session: SessionArgs,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import CityJSON Sequence files into the database
    Import(ImportArgs),

    /// Export features to a CityJSON Sequence file
    Export(ExportArgs),

    /// Delete or terminate features
    Delete(DeleteArgs),
}

/// Connexion configurée (env, puis fichier, puis CLI)
async fn connect(args: &DatabaseArgs, config: &Config) -> Result<(DatabaseConfig, Pool)> {
    let mut db_config = DatabaseConfig::from_env();
    db_config.apply(&args.section().or(&config.database));
    println!(
        "Database: {}@{}:{}/{} schema {} (SSL: {:?})",
        db_config.user, db_config.host, db_config.port, db_config.dbname, db_config.schema, db_config.ssl_mode
    );

    let pool = create_pool(&db_config).await?;
    test_connection(&pool).await?;
    println!("Connected to PostgreSQL");
    Ok((db_config, pool))
}

/// Features désignées explicitement (`None`: parcours complet)
async fn resolve_targets(
    pool: &Pool,
    schema_name: &str,
    ids: &[i64],
    objectids: &[String],
) -> Result<Option<Vec<FeatureRef>>> {
    if ids.is_empty() && objectids.is_empty() {
        return Ok(None);
    }
    let features = schema::resolve_features(pool, schema_name, ids, objectids).await?;
    let requested = ids.len() + objectids.len();
    if features.len() < requested {
        warn!(requested, found = features.len(), "Some requested features were not found");
    }
    Ok(Some(features))
}

type FeatureSource = Box<dyn Iterator<Item = citydb_ops::Result<FeatureRef>>>;

fn feature_source(
    adapter: &dyn DatabaseAdapter,
    targets: Option<Vec<FeatureRef>>,
    filter: &TypeFilter,
) -> citydb_ops::Result<FeatureSource> {
    match targets {
        Some(features) => {
            let filter = filter.clone();
            Ok(Box::new(
                features
                    .into_iter()
                    .filter(move |f| filter.accepts(&f.objectclass))
                    .map(Ok),
            ))
        }
        None => Ok(Box::new(IdCursor::open(adapter, filter, CURSOR_PAGE_SIZE)?)),
    }
}

/// Soumet les features d'une source puis finalise la session
///
/// Une erreur de la source annule la session.
fn drive<C, F>(session: &Session<C>, source: FeatureSource, to_item: F) -> citydb_ops::Result<SessionState>
where
    C: Command,
    F: Fn(FeatureRef) -> C::Item,
{
    for next in source {
        match next {
            Ok(feature) => {
                if !session.should_continue() {
                    break;
                }
                session.submit(to_item(feature));
            }
            Err(e) => {
                session.abort_session()?;
                return Err(e);
            }
        }
    }
    session.commit_session()
}

fn finish_report(report: &OperationReport, path: Option<&Path>) -> Result<()> {
    report.display();
    if let Some(path) = path {
        report
            .save_to_file(path)
            .with_context(|| format!("Failed to save report to {}", path.display()))?;
        println!("Report saved to {}", path.display());
    }
    if report.status == OperationStatus::Failed {
        anyhow::bail!("{}", report.summary());
    }
    Ok(())
}

fn parse_config_value<T: ValueEnum>(value: &str, key: &str) -> Result<T> {
    T::from_str(value, true).map_err(|e| anyhow::anyhow!("Invalid {} in config: {}", key, e))
}

/// Exécute la commande import
pub async fn cmd_import(args: ImportArgs, config: &Config) -> Result<()> {
    let inputs = collect_inputs(&args.path)?;
    if inputs.is_empty() {
        anyhow::bail!("No CityJSON Sequence files (.jsonl) found in {}", args.path);
    }

    let duplicates = match (args.duplicates, config.import.duplicates.as_deref()) {
        (Some(arg), _) => arg,
        (None, Some(value)) => parse_config_value(value, "import.duplicates")?,
        (None, None) => DuplicatesArg::None,
    };
    let cache = match (args.cache, config.import.cache.as_deref()) {
        (Some(arg), _) => arg,
        (None, Some(value)) => parse_config_value(value, "import.cache")?,
        (None, None) => CacheArg::Memory,
    };
    let backend = match cache {
        CacheArg::Memory => CacheBackend::Memory,
        CacheArg::Disk => CacheBackend::Disk {
            base_dir: args.temp_dir.clone().or_else(|| config.import.temp_dir.clone()),
        },
    };
    let requested_srid = args.srid.or(config.import.srid).unwrap_or(DEFAULT_SRID);

    info!(
        path = %args.path,
        files = inputs.len(),
        duplicates = ?duplicates,
        preview = args.session.preview,
        "Starting import"
    );

    let (db_config, pool) = connect(&args.db, config).await?;
    schema::create_schema(&pool, &db_config.schema, requested_srid, args.drop_schema).await?;
    let srid = match schema::detect_srid(&pool, &db_config.schema).await? {
        Some(existing) if existing != requested_srid => {
            warn!(existing, requested = requested_srid, "Schema already uses another SRID, keeping it");
            existing
        }
        _ => requested_srid,
    };

    let adapter = Arc::new(PostgresAdapter::new(pool, Handle::current(), db_config.schema.clone(), srid));
    let metadata = Metadata::from(&args.metadata);
    let options = args.session.options(&config.session, args.log_file.is_some());
    let job = ImportJob {
        root: input_root(&args.path),
        inputs,
        duplicates: duplicates.mode().map(|mode| DuplicateOptions {
            mode,
            backend,
            preview: args.session.preview,
            threads: options.threads,
            batch_size: options.batch_size,
            metadata: metadata.clone(),
        }),
        settings: ImportSettings {
            filter: TypeFilter::new(args.type_names.iter().cloned()),
            metadata,
            options,
        },
        adapter,
        skip_imported: args.skip_imported,
        log_file: args.log_file.clone(),
    };

    let report = tokio::task::spawn_blocking(move || job.run())
        .await
        .context("Import task failed")??;
    finish_report(&report, args.report.as_deref())
}

/// Paramètres communs aux fichiers d'un import
#[derive(Debug, Clone)]
struct ImportSettings {
    filter: TypeFilter,
    metadata: Metadata,
    options: SessionOptions,
}

struct ImportJob {
    /// Racine des clés de suivi des fichiers
    root: PathBuf,
    inputs: Vec<PathBuf>,
    adapter: Arc<PostgresAdapter>,
    settings: ImportSettings,
    duplicates: Option<DuplicateOptions>,
    skip_imported: bool,
    log_file: Option<PathBuf>,
}

enum FileOutcome {
    Imported {
        state: SessionState,
        log: Option<Arc<OperationLog>>,
    },
    Skipped,
}

impl ImportJob {
    fn run(self) -> Result<OperationReport> {
        let started = Instant::now();
        let mut report = OperationReport::new("import");
        report.preview = self.settings.options.transaction_mode == TransactionMode::AutoRollback;

        let shared: Arc<dyn DatabaseAdapter> = self.adapter.clone();
        let mut controller = self
            .duplicates
            .clone()
            .map(|options| DuplicateController::new(Arc::clone(&shared), options));
        let mut entries: Vec<LogEntry> = Vec::new();

        for (index, path) in self.inputs.iter().enumerate() {
            let name = file_key(&self.root, path);
            let checksum = match compute_file_checksum(path) {
                Ok(checksum) => Some(checksum),
                Err(e) => {
                    warn!("Failed to compute checksum for {}: {}", path.display(), e);
                    None
                }
            };

            if self.skip_imported {
                if let Some(checksum) = &checksum {
                    match self.already_imported(&name, checksum) {
                        Ok(true) => {
                            info!(file = %name, "File unchanged since last import, skipping");
                            report.record_file_skipped(&name, "unchanged since last import");
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => warn!("Failed to check file status: {}", e),
                    }
                }
            }

            match import_file(shared.as_ref(), &self.settings, path, controller.as_mut(), &mut report) {
                Ok(FileOutcome::Imported { state, log }) => {
                    report.record_file_success();
                    if state == SessionState::Committed {
                        if let Some(checksum) = &checksum {
                            if let Err(e) = self.record_checksum(&name, checksum) {
                                warn!("Failed to record file checksum: {}", e);
                            }
                        }
                    }
                    if let (Some(log), true) = (log, self.log_file.is_some()) {
                        entries.extend(log.committed_entries());
                    }
                }
                Ok(FileOutcome::Skipped) => {
                    info!(file = %name, "All features already exist, skipping file");
                    report.record_file_skipped(&name, "all features already exist");
                }
                Err(e) => {
                    error!(file = %name, error = %e, "Import failed, file rolled back");
                    report.record_file_failure(&name, &format!("{:#}", e));
                }
            }

            let done = index + 1;
            if done % 100 == 0 {
                info!(processed = done, total = self.inputs.len(), "Import progress");
            }
        }

        if let Some(controller) = controller.as_mut() {
            controller.close_cache();
        }
        if let Some(path) = &self.log_file {
            let written = write_entries_csv(path, &entries)?;
            info!(path = %path.display(), entries = written, "Log file written");
        }

        report.set_duration(started.elapsed());
        report.finalize();
        Ok(report)
    }

    fn already_imported(&self, name: &str, checksum: &str) -> Result<bool> {
        self.adapter.handle().block_on(schema::is_file_already_imported(
            self.adapter.pool(),
            self.adapter.schema(),
            name,
            checksum,
        ))
    }

    fn record_checksum(&self, name: &str, checksum: &str) -> Result<()> {
        self.adapter.handle().block_on(schema::record_file_checksum(
            self.adapter.pool(),
            self.adapter.schema(),
            name,
            checksum,
        ))
    }
}

/// Importe un fichier dans une session dédiée
///
/// La détection des doublons (si active) lit le fichier une première fois;
/// l'import le relit et écarte les doublons. Une erreur de lecture annule
/// toute la session du fichier.
fn import_file(
    adapter: &dyn DatabaseAdapter,
    settings: &ImportSettings,
    path: &Path,
    mut controller: Option<&mut DuplicateController>,
    report: &mut OperationReport,
) -> Result<FileOutcome> {
    if let Some(controller) = controller.as_deref_mut() {
        let decision = controller.process_duplicates(CityJsonSeqReader::open(path)?, &settings.filter)?;
        report.record_duplicates(controller.counts());
        if decision == FileDecision::SkipFile {
            return Ok(FileOutcome::Skipped);
        }
    }

    let importer = Importer::new(ImportCommand::new(settings.metadata.clone()));
    importer.start(adapter, settings.options.clone())?;

    let mut skipped = 0u64;
    let mut read_error = None;
    for next in CityJsonSeqReader::open(path)? {
        let feature = match next {
            Ok(feature) => feature,
            Err(e) => {
                read_error = Some(e);
                break;
            }
        };
        if !settings.filter.accepts(&feature.objectclass) {
            continue;
        }
        if let Some(controller) = controller.as_deref() {
            if controller.is_duplicate(&feature)? {
                skipped += 1;
                continue;
            }
        }
        if !importer.should_continue() {
            break;
        }
        importer.submit(feature);
    }
    report.record_duplicate_skips(skipped);

    if let Some(e) = read_error {
        importer.abort_session()?;
        report.record_statistics(&importer.statistics());
        return Err(e.into());
    }

    let outcome = importer.commit_session();
    let statistics = importer.statistics();
    report.record_statistics(&statistics);
    let state = outcome?;

    info!(
        file = %path.display(),
        state = %state,
        committed = statistics.committed,
        duplicates = skipped,
        "File imported"
    );
    Ok(FileOutcome::Imported {
        state,
        log: importer.log(),
    })
}

/// Exécute la commande export
pub async fn cmd_export(args: ExportArgs, config: &Config) -> Result<()> {
    let (db_config, pool) = connect(&args.db, config).await?;
    let srid = schema::detect_srid(&pool, &db_config.schema)
        .await?
        .unwrap_or(DEFAULT_SRID);
    let targets = resolve_targets(&pool, &db_config.schema, &args.ids, &args.objectids).await?;
    let adapter = PostgresAdapter::new(pool, Handle::current(), db_config.schema.clone(), srid);

    let filter = TypeFilter::new(args.type_names.iter().cloned());
    let session = SessionArgs {
        threads: args.threads,
        batch_size: args.batch_size,
        ..Default::default()
    };
    let options = SessionOptions {
        transaction_mode: TransactionMode::Manual,
        ..session.options(&config.session, false)
    };
    let output = args.output.clone();

    info!(output = %output.display(), "Starting export");
    let report = tokio::task::spawn_blocking(move || run_export(&adapter, targets, &filter, options, &output))
        .await
        .context("Export task failed")??;

    println!("Export written to {}", args.output.display());
    finish_report(&report, args.report.as_deref())
}

fn run_export(
    adapter: &dyn DatabaseAdapter,
    targets: Option<Vec<FeatureRef>>,
    filter: &TypeFilter,
    options: SessionOptions,
    output: &Path,
) -> Result<OperationReport> {
    let started = Instant::now();
    let mut report = OperationReport::new("export");

    let writer = Arc::new(CityJsonSeqWriter::create(output)?);
    let sink: Arc<dyn FeatureSink> = writer.clone();
    let exporter = Exporter::new(ExportCommand::new(sink));
    exporter.start(adapter, options)?;

    let outcome = feature_source(adapter, targets, filter)
        .and_then(|source| drive(&exporter, source, |feature| feature.id));
    report.record_statistics(&exporter.statistics());
    if let Err(e) = outcome {
        exporter.abort_session()?;
        error!(error = %e, "Export failed");
        report.record_fatal(&e.to_string());
    }

    let written = writer.finish()?;
    info!(features = written, "Export finished");

    report.set_duration(started.elapsed());
    report.finalize();
    Ok(report)
}

/// Exécute la commande delete
pub async fn cmd_delete(args: DeleteArgs, config: &Config) -> Result<()> {
    if args.ids.is_empty() && args.objectids.is_empty() && args.type_names.is_empty() && !args.all {
        anyhow::bail!("Refusing to delete every feature: pass --id, --objectid, --type-name or --all");
    }

    let (db_config, pool) = connect(&args.db, config).await?;
    let srid = schema::detect_srid(&pool, &db_config.schema)
        .await?
        .unwrap_or(DEFAULT_SRID);
    let targets = resolve_targets(&pool, &db_config.schema, &args.ids, &args.objectids).await?;
    let adapter = PostgresAdapter::new(pool, Handle::current(), db_config.schema.clone(), srid);

    let command = DeleteCommand::new(args.mode.into(), Metadata::from(&args.metadata));
    let filter = TypeFilter::new(args.type_names.iter().cloned());
    let options = args.session.options(&config.session, args.log_file.is_some());
    let log_file = args.log_file.clone();

    info!(mode = ?args.mode, preview = args.session.preview, "Starting delete");
    let report = tokio::task::spawn_blocking(move || {
        run_delete(&adapter, targets, &filter, command, options, log_file.as_deref())
    })
    .await
    .context("Delete task failed")??;

    finish_report(&report, args.report.as_deref())
}

fn run_delete(
    adapter: &dyn DatabaseAdapter,
    targets: Option<Vec<FeatureRef>>,
    filter: &TypeFilter,
    command: DeleteCommand,
    options: SessionOptions,
    log_file: Option<&Path>,
) -> Result<OperationReport> {
    let started = Instant::now();
    let mut report = OperationReport::new(command.name());
    report.preview = options.transaction_mode == TransactionMode::AutoRollback;

    let deleter = Deleter::new(command);
    deleter.start(adapter, options)?;

    let outcome = feature_source(adapter, targets, filter)
        .and_then(|source| drive(&deleter, source, DeleteItem::from));
    report.record_statistics(&deleter.statistics());
    match outcome {
        Ok(state) => info!(state = %state, committed = report.committed, "Delete finished"),
        Err(e) => {
            deleter.abort_session()?;
            error!(error = %e, "Delete failed, changes rolled back");
            report.record_fatal(&e.to_string());
        }
    }

    if let (Some(path), Some(log)) = (log_file, deleter.log()) {
        let written = log.write_csv(path)?;
        info!(path = %path.display(), entries = written, "Log file written");
    }

    report.set_duration(started.elapsed());
    report.finalize();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use citydb_ops::testing::{MemoryAdapter, MemoryDatabase};
    use citydb_ops::StatementKind;

    const HEADER: &str = r#"{"type":"CityJSON","version":"2.0","transform":{"scale":[0.001,0.001,0.001],"translate":[0.0,0.0,0.0]},"CityObjects":{},"vertices":[]}"#;

    fn feature_line(id: &str, class: &str) -> String {
        format!(
            r#"{{"type":"CityJSONFeature","id":"{id}","CityObjects":{{"{id}":{{"type":"{class}","attributes":{{"storeys":2}}}}}},"vertices":[[0,0,0],[1000,1000,1000]]}}"#
        )
    }

    fn sequence_file(dir: &tempfile::TempDir, name: &str, features: &[(&str, &str)]) -> PathBuf {
        let mut lines = vec![HEADER.to_string()];
        lines.extend(features.iter().map(|(id, class)| feature_line(id, class)));
        let path = dir.path().join(name);
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn settings(filter: TypeFilter) -> ImportSettings {
        ImportSettings {
            filter,
            metadata: Metadata::default(),
            options: SessionOptions::default().threads(2),
        }
    }

    fn objectids(db: &MemoryDatabase) -> Vec<String> {
        let mut ids: Vec<String> = db.features().into_iter().filter_map(|f| f.objectid).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_session_options_mapping() {
        let defaults = SessionSection {
            threads: Some(6),
            commit_every: Some(500),
            ..Default::default()
        };
        let options = SessionArgs::default().options(&defaults, false);
        assert_eq!(options.threads, Some(6));
        assert_eq!(options.transaction_mode, TransactionMode::AutoCommit(500));

        let args = SessionArgs {
            preview: true,
            commit_every: Some(10),
            ..Default::default()
        };
        assert_eq!(args.options(&defaults, true).transaction_mode, TransactionMode::AutoRollback);

        let args = SessionArgs {
            commit_every: Some(0),
            ..Default::default()
        };
        assert_eq!(
            args.options(&SessionSection::default(), false).transaction_mode,
            TransactionMode::Manual
        );
    }

    #[test]
    fn test_config_values_parse_like_flags() {
        let arg: DuplicatesArg = parse_config_value("Terminate", "import.duplicates").unwrap();
        assert_eq!(arg.mode(), Some(DuplicateMode::TerminateExisting));
        assert_eq!(DuplicatesArg::None.mode(), None);
        assert!(parse_config_value::<CacheArg>("redis", "import.cache").is_err());
    }

    #[test]
    fn test_import_file_writes_features() {
        let dir = tempfile::tempdir().unwrap();
        let path = sequence_file(&dir, "a.jsonl", &[("a", "Building"), ("r", "Road"), ("b", "Building")]);
        let db = Arc::new(MemoryDatabase::new());
        let adapter = MemoryAdapter::new(Arc::clone(&db));
        let mut report = OperationReport::new("import");

        let outcome = import_file(
            &adapter,
            &settings(TypeFilter::new(["Building"])),
            &path,
            None,
            &mut report,
        )
        .unwrap();
        assert!(matches!(outcome, FileOutcome::Imported { state: SessionState::Committed, .. }));
        assert_eq!(objectids(&db), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(report.committed, 2);
        assert_eq!(report.by_class.get("Building"), Some(&2));

        let stored = db.features();
        assert_eq!(stored[0].envelope, Some([0.0, 0.0, 1.0, 1.0]));
        assert_eq!(db.properties_of(stored[0].id).len(), 1);
    }

    #[test]
    fn test_import_file_skips_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = sequence_file(&dir, "a.jsonl", &[("a", "Building"), ("b", "Building")]);
        let db = Arc::new(MemoryDatabase::new());
        db.insert_feature("a", "Building");
        db.insert_feature("b", "Building");
        let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&db)));
        let mut controller = DuplicateController::new(adapter.clone(), DuplicateOptions::default());
        let mut report = OperationReport::new("import");

        let outcome = import_file(
            adapter.as_ref(),
            &settings(TypeFilter::all()),
            &path,
            Some(&mut controller),
            &mut report,
        )
        .unwrap();
        assert!(matches!(outcome, FileOutcome::Skipped));
        assert_eq!(report.duplicates.in_database, 2);
        assert!(db.executions_of(StatementKind::InsertFeatures).is_empty());
    }

    #[test]
    fn test_import_file_filters_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = sequence_file(
            &dir,
            "a.jsonl",
            &[("a", "Building"), ("b", "Building"), ("b", "Building"), ("c", "Building")],
        );
        let db = Arc::new(MemoryDatabase::new());
        db.insert_feature("a", "Building");
        let adapter = Arc::new(MemoryAdapter::new(Arc::clone(&db)));
        let mut controller = DuplicateController::new(adapter.clone(), DuplicateOptions::default());
        let mut report = OperationReport::new("import");

        import_file(
            adapter.as_ref(),
            &settings(TypeFilter::all()),
            &path,
            Some(&mut controller),
            &mut report,
        )
        .unwrap();
        assert_eq!(objectids(&db), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(report.duplicates.features_skipped, 2);
        assert_eq!(report.committed, 2);
    }

    #[test]
    fn test_import_file_rolls_back_on_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jsonl");
        std::fs::write(
            &path,
            format!("{}\n{}\n{{truncated", HEADER, feature_line("a", "Building")),
        )
        .unwrap();
        let db = Arc::new(MemoryDatabase::new());
        let adapter = MemoryAdapter::new(Arc::clone(&db));
        let mut report = OperationReport::new("import");

        let result = import_file(&adapter, &settings(TypeFilter::all()), &path, None, &mut report);
        assert!(result.is_err());
        assert!(db.features().is_empty());
        assert_eq!(report.committed, 0);
    }

    #[test]
    fn test_run_delete_with_cursor_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDatabase::new());
        db.insert_feature("a", "Building");
        db.insert_feature("r", "Road");
        db.insert_feature("b", "Building");
        let adapter = MemoryAdapter::new(Arc::clone(&db));
        let log_path = dir.path().join("deleted.csv");

        let report = run_delete(
            &adapter,
            None,
            &TypeFilter::new(["Building"]),
            DeleteCommand::default(),
            SessionOptions::default().threads(2).keep_log_entries(true),
            Some(&log_path),
        )
        .unwrap();
        assert_eq!(report.status, OperationStatus::Success);
        assert_eq!(report.committed, 2);
        assert_eq!(objectids(&db), vec!["r".to_string()]);

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(log.lines().count(), 3);
    }

    #[test]
    fn test_run_delete_preview_keeps_rows() {
        let db = Arc::new(MemoryDatabase::new());
        let a = db.insert_feature("a", "Building");
        db.insert_feature("b", "Building");
        let adapter = MemoryAdapter::new(Arc::clone(&db));
        let targets = vec![FeatureRef {
            id: a,
            objectid: Some("a".into()),
            objectclass: "Building".into(),
        }];

        let report = run_delete(
            &adapter,
            Some(targets),
            &TypeFilter::all(),
            DeleteCommand::new(DeleteMode::Terminate, Metadata::default()),
            SessionOptions::default().transaction_mode(TransactionMode::AutoRollback),
            None,
        )
        .unwrap();
        assert_eq!(report.operation, "terminate");
        assert_eq!(report.status, OperationStatus::Preview);
        assert_eq!(report.rolled_back, 1);
        assert_eq!(db.live_ids().len(), 2);
    }

    #[test]
    fn test_run_export_writes_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDatabase::new());
        db.insert_feature("a", "Building");
        db.insert_feature("b", "Building");
        let adapter = MemoryAdapter::new(Arc::clone(&db));
        let output = dir.path().join("out.jsonl");

        let report = run_export(
            &adapter,
            None,
            &TypeFilter::all(),
            SessionOptions::default().threads(2),
            &output,
        )
        .unwrap();
        assert_eq!(report.committed, 2);

        let exported: Vec<_> = CityJsonSeqReader::open(&output)
            .unwrap()
            .map(|f| f.unwrap().objectid.unwrap())
            .collect();
        assert_eq!(exported.len(), 2);
        assert!(exported.contains(&"a".to_string()));
    }
}
