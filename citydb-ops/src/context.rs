//! Contexte de travail d'un worker
//!
//! Chaque worker du pool possède son propre [`WorkerContext`]: ses writers,
//! son bloc d'identifiants réservés. Aucun état de lot n'est partagé entre
//! workers; seule la connexion de session l'est.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::batch::{BatchRow, BatchWriter, TableKind};
use crate::database::{SessionConnection, SqlParam, Statement};
use crate::error::{DbError, OpsError, Result};
use crate::log::OperationLog;

/// Environnement commun aux writers d'une session
pub struct WriterEnv {
    pub connection: Arc<SessionConnection>,
    pub log: Arc<OperationLog>,
    pub schema: String,
    pub srid: u32,
    /// Seuil de flush des writers
    pub batch_size: usize,
}

/// Fabrique des writers d'une opération
pub trait WriterFactory: Send + Sync {
    fn create_writer(&self, kind: TableKind, env: &WriterEnv) -> Result<Box<dyn BatchWriter>>;
}

/// Contexte propre à un worker
pub struct WorkerContext {
    worker: usize,
    env: Arc<WriterEnv>,
    factory: Arc<dyn WriterFactory>,
    writers: BTreeMap<TableKind, Box<dyn BatchWriter>>,
    reserved_ids: VecDeque<i64>,
}

impl WorkerContext {
    pub fn new(worker: usize, env: Arc<WriterEnv>, factory: Arc<dyn WriterFactory>) -> Self {
        Self {
            worker,
            env,
            factory,
            writers: BTreeMap::new(),
            reserved_ids: VecDeque::new(),
        }
    }

    /// Index du worker propriétaire
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn env(&self) -> &WriterEnv {
        &self.env
    }

    /// Writer d'un type donné, créé au premier accès
    pub fn writer(&mut self, kind: TableKind) -> Result<&mut dyn BatchWriter> {
        match self.writers.entry(kind) {
            Entry::Occupied(entry) => Ok(entry.into_mut().as_mut()),
            Entry::Vacant(entry) => {
                let writer = self.factory.create_writer(kind, &self.env)?;
                debug!(worker = self.worker, writer = %kind, "Created batch writer");
                Ok(entry.insert(writer).as_mut())
            }
        }
    }

    /// Ajoute une ligne au writer `kind`
    pub fn add(&mut self, kind: TableKind, row: BatchRow) -> Result<()> {
        self.writer(kind)?.add(row)
    }

    /// Lignes en attente, tous writers confondus
    pub fn pending(&self) -> usize {
        self.writers.values().map(|w| w.pending()).sum()
    }

    /// Flushe tous les writers dans l'ordre des tables
    ///
    /// Au premier échec, les writers restants sont vidés sans exécution.
    pub fn flush_all(&mut self) -> Result<u64> {
        let mut affected = 0;
        let mut failure = None;
        for writer in self.writers.values_mut() {
            if failure.is_some() {
                writer.discard();
                continue;
            }
            match writer.force_flush() {
                Ok(rows) => affected += rows,
                Err(e) => failure = Some(e),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(affected),
        }
    }

    /// Abandonne les lignes en attente de tous les writers
    pub fn discard_all(&mut self) -> usize {
        let discarded = self.writers.values_mut().map(|w| w.discard()).sum();
        if discarded > 0 {
            trace!(worker = self.worker, rows = discarded, "Discarded worker batches");
        }
        discarded
    }

    /// Prochain identifiant de feature
    ///
    /// Les identifiants sont réservés par blocs de `batch_size` via la
    /// requête construite par `reserve` (un seul paramètre: la taille).
    pub fn next_id<F>(&mut self, reserve: F) -> Result<i64>
    where
        F: FnOnce(&str) -> Statement,
    {
        if self.reserved_ids.is_empty() {
            let statement = reserve(&self.env.schema);
            let count = self.env.batch_size.max(1) as i64;
            let rows = self
                .env
                .connection
                .query(&statement, &[SqlParam::BigInt(count)])?;
            self.reserved_ids
                .extend(rows.iter().filter_map(|row| row.first().and_then(|v| v.as_i64())));
            trace!(worker = self.worker, reserved = self.reserved_ids.len(), "Reserved feature ids");
        }
        self.reserved_ids
            .pop_front()
            .ok_or_else(|| OpsError::Database(DbError::new("id reservation returned no rows")))
    }
}

/// Emplacements par worker
///
/// Le worker `i` n'accède qu'à l'emplacement `i`; le verrou sert aux
/// checkpoints et à la collecte finale, menés depuis un autre thread.
pub struct WorkerSlots<T> {
    slots: Vec<Mutex<Option<T>>>,
}

impl<T> WorkerSlots<T> {
    pub fn new(workers: usize) -> Self {
        Self {
            slots: (0..workers).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Applique `f` à l'emplacement du worker, initialisé au besoin
    pub fn with<R>(&self, worker: usize, init: impl FnOnce() -> T, f: impl FnOnce(&mut T) -> R) -> R {
        let mut slot = self.slots[worker].lock();
        f(slot.get_or_insert_with(init))
    }

    /// Applique `f` à chaque valeur initialisée, dans l'ordre des workers
    ///
    /// S'arrête à la première erreur.
    pub fn try_for_each<E>(
        &self,
        mut f: impl FnMut(&mut T) -> std::result::Result<(), E>,
    ) -> std::result::Result<(), E> {
        for slot in &self.slots {
            if let Some(value) = slot.lock().as_mut() {
                f(value)?;
            }
        }
        Ok(())
    }

    /// Nombre d'emplacements initialisés
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().is_some()).count()
    }

    /// Retire toutes les valeurs initialisées
    pub fn drain(&self) -> Vec<T> {
        self.slots.iter().filter_map(|s| s.lock().take()).collect()
    }
}
