//! Contrôle des doublons d'un fichier avant import
//!
//! Un passage de détection lit tout le fichier: chaque première occurrence
//! d'objectid est envoyée à un finder (un par worker) qui interroge la base
//! par lots. Les objectids répétés dans le fichier ne sont pas réinterrogés.
//! Selon le mode, le fichier est ensuite ignoré, ou les features existantes
//! sont supprimées/terminées avant l'import.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, error, info, warn};

use crate::context::WorkerSlots;
use crate::database::{DatabaseAdapter, SessionConnection};
use crate::error::{CacheError, OpsError, Result};
use crate::feature::{CityFeature, TypeFilter};
use crate::latch::CountLatch;
use crate::operation::DeleteMode;
use crate::pool::{default_threads, WorkerPool};

use super::cache::IdentityCache;
use super::deleter::DuplicateDeleter;
use super::finder::DuplicateFinder;
use super::{DuplicateCounts, DuplicateMode, DuplicateOptions, FileDecision};

/// État partagé d'un passage de détection
struct Probe {
    schema: String,
    max_in_operator_size: usize,
    connection: Arc<SessionConnection>,
    cache: Arc<IdentityCache>,
    finders: WorkerSlots<DuplicateFinder>,
    latch: CountLatch,
    failure: OnceLock<OpsError>,
    should_continue: AtomicBool,
}

impl Probe {
    fn fail(&self, error: OpsError) {
        if let Err(error) = self.failure.set(error) {
            debug!(error = %error, "Additional duplicate detection failure");
        }
        self.should_continue.store(false, Ordering::SeqCst);
    }

    fn run(&self, worker: usize, objectid: String) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.finders.with(
                worker,
                || {
                    DuplicateFinder::new(
                        &self.schema,
                        self.max_in_operator_size,
                        Arc::clone(&self.connection),
                        Arc::clone(&self.cache),
                    )
                },
                |finder| finder.add(objectid),
            )
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(e),
            Err(_) => self.fail(OpsError::Panicked("duplicate finder panicked".into())),
        }
        if let Err(e) = self.latch.decrement() {
            error!(error = %e, "Latch accounting error");
        }
    }

    /// Regroupe les lots restants dans un seul finder et l'exécute
    fn merge_and_flush(&self) -> Result<usize> {
        let mut finders = self.finders.drain().into_iter();
        let Some(mut survivor) = finders.next() else {
            return Ok(0);
        };
        for mut finder in finders {
            for objectid in finder.take_pending() {
                survivor.add(objectid)?;
            }
        }
        survivor.flush()
    }
}

/// Contrôleur de doublons
pub struct DuplicateController {
    adapter: Arc<dyn DatabaseAdapter>,
    options: DuplicateOptions,
    cache: Option<Arc<IdentityCache>>,
    counts: DuplicateCounts,
}

impl DuplicateController {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, options: DuplicateOptions) -> Self {
        Self {
            adapter,
            options,
            cache: None,
            counts: DuplicateCounts::default(),
        }
    }

    pub fn options(&self) -> &DuplicateOptions {
        &self.options
    }

    /// Compteurs du dernier passage
    pub fn counts(&self) -> &DuplicateCounts {
        &self.counts
    }

    /// Cache du dernier passage
    pub fn cache(&self) -> Option<&IdentityCache> {
        self.cache.as_deref()
    }

    /// Analyse un fichier et décide de son import
    ///
    /// Le cache du passage précédent est fermé et un nouveau est créé. En
    /// mode suppression/terminaison, les features existantes sont retirées
    /// avant le retour.
    ///
    /// # Errors
    /// Premier échec d'un finder, du lecteur, du cache ou de la suppression;
    /// la lecture du fichier est interrompue dès l'échec et le cache du
    /// passage est fermé.
    pub fn process_duplicates<I>(&mut self, features: I, filter: &TypeFilter) -> Result<FileDecision>
    where
        I: IntoIterator<Item = Result<CityFeature>>,
    {
        self.close_cache();
        let cache = Arc::new(IdentityCache::open(&self.options.backend)?);
        self.cache = Some(Arc::clone(&cache));
        self.counts = DuplicateCounts::default();

        let decision = self.decide(features, filter, &cache);
        drop(cache);
        if let Err(e) = &decision {
            warn!(error = %e, "Duplicate detection failed, closing cache");
            self.close_cache();
        }
        decision
    }

    fn decide<I>(
        &mut self,
        features: I,
        filter: &TypeFilter,
        cache: &Arc<IdentityCache>,
    ) -> Result<FileDecision>
    where
        I: IntoIterator<Item = Result<CityFeature>>,
    {
        let counts = self.probe(features, filter, Arc::clone(cache))?;
        self.counts = counts;

        let decision = match self.options.mode {
            DuplicateMode::SkipExisting => {
                if counts.features > 0 && counts.in_database == counts.features {
                    FileDecision::SkipFile
                } else {
                    FileDecision::AcceptFile
                }
            }
            DuplicateMode::DeleteExisting | DuplicateMode::TerminateExisting => {
                if counts.distinct_in_database > 0 {
                    let mode = if self.options.mode == DuplicateMode::TerminateExisting {
                        DeleteMode::Terminate
                    } else {
                        DeleteMode::Delete
                    };
                    let statistics = DuplicateDeleter::new(
                        Arc::clone(&self.adapter),
                        mode,
                        self.options.metadata.clone(),
                    )
                    .preview(self.options.preview)
                    .threads(self.options.threads)
                    .batch_size(self.options.batch_size)
                    .run(cache)?;
                    self.counts.removed = statistics.committed;
                    self.counts.removal_previewed = statistics.rolled_back;
                }
                FileDecision::AcceptFile
            }
        };

        info!(
            mode = ?self.options.mode,
            features = self.counts.features,
            duplicates_in_file = self.counts.in_file,
            duplicates_in_database = self.counts.in_database,
            removed = self.counts.removed,
            decision = ?decision,
            "Duplicate detection finished"
        );
        Ok(decision)
    }

    fn probe<I>(&self, features: I, filter: &TypeFilter, cache: Arc<IdentityCache>) -> Result<DuplicateCounts>
    where
        I: IntoIterator<Item = Result<CityFeature>>,
    {
        let threads = self.options.threads.unwrap_or_else(default_threads).max(1);
        let connection = Arc::new(SessionConnection::new(self.adapter.connect()?));
        let pool = WorkerPool::new("dedup", threads, threads * 64)?;

        let probe = Arc::new(Probe {
            schema: self.adapter.schema().to_string(),
            max_in_operator_size: self.adapter.max_in_operator_size(),
            connection,
            cache: Arc::clone(&cache),
            finders: WorkerSlots::new(pool.size()),
            latch: CountLatch::new(),
            failure: OnceLock::new(),
            should_continue: AtomicBool::new(true),
        });

        let mut counts = DuplicateCounts::default();
        for next in features {
            if !probe.should_continue.load(Ordering::SeqCst) {
                break;
            }
            let feature = match next {
                Ok(feature) => feature,
                Err(e) => {
                    probe.fail(e);
                    break;
                }
            };
            if !filter.accepts(&feature.objectclass) {
                continue;
            }
            counts.features += 1;
            let Some(objectid) = feature.objectid else {
                continue;
            };
            match cache.record_seen(&objectid) {
                Ok(1) => {}
                Ok(_) => {
                    counts.in_file += 1;
                    continue;
                }
                Err(e) => {
                    probe.fail(e.into());
                    break;
                }
            }

            probe.latch.increment();
            let task_probe = Arc::clone(&probe);
            if let Err(e) = pool.execute(Box::new(move |worker| task_probe.run(worker, objectid))) {
                if let Err(latch_error) = probe.latch.decrement() {
                    error!(error = %latch_error, "Latch accounting error");
                }
                probe.fail(e);
                break;
            }
        }

        probe.latch.wait();
        let merged = match probe.failure.get() {
            Some(failure) => Err(failure.clone()),
            None => probe.merge_and_flush(),
        };
        pool.shutdown();
        // Lecture seule: la transaction implicite est close dans tous les cas
        if let Err(e) = probe.connection.rollback_with(|| {}) {
            warn!(error = %e, "Failed to release duplicate detection connection");
        }
        merged?;

        let mut in_database = 0u64;
        let mut count_error: Option<CacheError> = None;
        let confirmed = cache.confirmed_objectids()?;
        for objectid in &confirmed {
            match cache.seen_count(objectid) {
                Ok(seen) => in_database += seen,
                Err(e) => {
                    count_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = count_error {
            return Err(e.into());
        }
        counts.in_database = in_database;
        counts.distinct_in_database = confirmed.len() as u64;
        counts.distinct = cache.distinct_seen()? as u64;
        Ok(counts)
    }

    /// Vrai si la feature ne doit pas être importée
    ///
    /// En mode `SkipExisting`, une feature déjà présente en base est un
    /// doublon. Dans tous les modes, seule la première occurrence d'un
    /// objectid dans le fichier est acceptée. Les features sans objectid ne
    /// sont jamais des doublons.
    ///
    /// # Errors
    /// `Cache(Closed)` si aucun passage de détection n'a eu lieu.
    pub fn is_duplicate(&self, feature: &CityFeature) -> Result<bool> {
        let Some(objectid) = feature.objectid.as_deref() else {
            return Ok(false);
        };
        let cache = self.cache.as_ref().ok_or(CacheError::Closed)?;
        if self.options.mode == DuplicateMode::SkipExisting && cache.is_confirmed(objectid)? {
            return Ok(true);
        }
        Ok(!cache.mark_accepted(objectid)?)
    }

    /// Ferme le cache courant (répertoire disque supprimé)
    pub fn close_cache(&mut self) {
        let Some(cache) = self.cache.take() else {
            return;
        };
        match Arc::try_unwrap(cache) {
            Ok(cache) => {
                if let Err(e) = cache.close() {
                    warn!(error = %e, "Failed to remove duplicate cache");
                }
            }
            Err(_) => debug!("Duplicate cache still shared, released on last drop"),
        }
    }
}

impl Drop for DuplicateController {
    fn drop(&mut self) {
        self.close_cache();
    }
}
