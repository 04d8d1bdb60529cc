//! Sessions d'opération en masse
//!
//! Une session possède une connexion en commit manuel et un pool de workers.
//! Les éléments soumis sont appliqués en parallèle par la [`Command`] de la
//! session, chaque worker écrivant dans ses propres lots. La finalisation
//! (commit ou abort) attend la fin de tout le travail soumis avant de
//! franchir la frontière de transaction.
//!
//! ```text
//! NotStarted --start--> Started --commit--> Committed
//!     |                    |  \--abort/échec--> Aborted
//!     \-------abort--------+---------------------^
//! ```

mod completion;

pub use completion::Completion;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::{WorkerContext, WorkerSlots, WriterEnv, WriterFactory};
use crate::database::{DatabaseAdapter, SessionConnection};
use crate::error::{OpsError, Result};
use crate::latch::CountLatch;
use crate::log::OperationLog;
use crate::pool::{default_threads, WorkerPool};
use crate::statistics::Statistics;

use completion::Completer;

/// État du cycle de vie d'une session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    Started,
    Committed,
    Aborted,
}

impl SessionState {
    /// Commit ou abort effectué
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Started => "started",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Politique transactionnelle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// Un seul commit à la finalisation
    #[default]
    Manual,
    /// Commit intermédiaire tous les `n` éléments appliqués
    AutoCommit(u64),
    /// Aperçu: tout est exécuté puis annulé
    AutoRollback,
}

/// Options de démarrage d'une session
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Nombre de workers (défaut: `max(2, parallélisme)`)
    pub threads: Option<usize>,
    /// Seuil de flush des lots (plafonné par l'adaptateur)
    pub batch_size: Option<usize>,
    /// Capacité de la file du pool (défaut: 64 par worker)
    pub queue_capacity: Option<usize>,
    pub transaction_mode: TransactionMode,
    /// Conserver chaque entrée commitée dans le journal
    pub keep_log_entries: bool,
}

impl SessionOptions {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    pub fn keep_log_entries(mut self, keep: bool) -> Self {
        self.keep_log_entries = keep;
        self
    }
}

/// Opération appliquée à chaque élément soumis
///
/// `apply` s'exécute dans un worker avec le contexte propre à ce worker.
pub trait Command: WriterFactory + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    /// Nom court (threads, logs)
    fn name(&self) -> &'static str;

    fn apply(&self, ctx: &mut WorkerContext, item: Self::Item) -> Result<Self::Output>;
}

/// État partagé entre la session et les tâches en vol
struct Shared<C: Command> {
    command: Arc<C>,
    env: Arc<WriterEnv>,
    contexts: WorkerSlots<WorkerContext>,
    /// Lecture: application d'un élément; écriture: checkpoint
    checkpoints: RwLock<()>,
    latch: CountLatch,
    failure: Arc<OnceLock<OpsError>>,
    counters: Arc<Counters>,
    should_continue: AtomicBool,
    mode: TransactionMode,
    applied: AtomicU64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    failed: AtomicU64,
}

struct Running<C: Command> {
    shared: Arc<Shared<C>>,
    pool: WorkerPool,
}

struct Lifecycle<C: Command> {
    state: SessionState,
    running: Option<Running<C>>,
    log: Option<Arc<OperationLog>>,
    started_at: Option<Instant>,
    duration: Option<Duration>,
}

/// Session d'opération en masse
pub struct Session<C: Command> {
    command: Arc<C>,
    lifecycle: RwLock<Lifecycle<C>>,
    failure: Arc<OnceLock<OpsError>>,
    counters: Arc<Counters>,
}

impl<C: Command> Shared<C> {
    fn record_failure(&self, error: &OpsError) {
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        if self.failure.set(error.clone()).is_ok() {
            error!(operation = self.command.name(), error = %error, "Session failed, cancelling remaining work");
        }
        self.should_continue.store(false, Ordering::SeqCst);
    }

    fn context<R>(&self, worker: usize, f: impl FnOnce(&mut WorkerContext) -> R) -> R {
        self.contexts.with(
            worker,
            || {
                let factory: Arc<dyn WriterFactory> = self.command.clone();
                WorkerContext::new(worker, Arc::clone(&self.env), factory)
            },
            f,
        )
    }

    /// Corps d'une tâche: application, checkpoint, résultat, latch
    ///
    /// Une tâche déjà planifiée s'exécute même après un échec: seule la
    /// soumission de nouveaux éléments est refusée.
    fn run(&self, worker: usize, item: C::Item, completer: Completer<C::Output>) {
        let outcome = {
            let _applying = self.checkpoints.read();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.context(worker, |ctx| self.command.apply(ctx, item))
            }))
            .unwrap_or_else(|payload| Err(OpsError::Panicked(panic_message(payload.as_ref()))));
            // L'échec est visible avant qu'un checkpoint ne puisse passer
            if let Err(e) = &outcome {
                self.record_failure(e);
            }
            outcome
        };

        if outcome.is_ok() {
            self.after_success(worker);
        }

        completer.complete(outcome);
        if let Err(e) = self.latch.decrement() {
            error!(operation = self.command.name(), error = %e, "Latch accounting error");
        }
    }

    fn after_success(&self, worker: usize) {
        let TransactionMode::AutoCommit(every) = self.mode else {
            return;
        };
        let applied = self.applied.fetch_add(1, Ordering::SeqCst) + 1;
        if every > 0 && applied % every == 0 {
            self.checkpoint(worker);
        }
    }

    /// Commit intermédiaire sur toute la session
    ///
    /// Le verrou exclusif attend la fin des applications en cours et bloque
    /// les suivantes. Les lots de tous les workers sont alors flushés, dans
    /// l'ordre des tables, puis commités: un élément n'est jamais commité à
    /// moitié, et rien n'est commité après un échec.
    fn checkpoint(&self, worker: usize) {
        let _barrier = self.checkpoints.write();
        if self.failure.get().is_some() {
            debug!(worker, "Skipping checkpoint after failure");
            return;
        }
        if let Err(e) = self.contexts.try_for_each(|ctx| ctx.flush_all().map(|_| ())) {
            self.record_failure(&e);
            return;
        }
        let log = &self.env.log;
        match self.env.connection.commit_with(|| {
            log.commit();
        }) {
            Ok(()) => debug!(
                operation = self.command.name(),
                worker,
                committed = log.committed_count(),
                "Checkpoint committed"
            ),
            Err(e) => self.record_failure(&e.into()),
        }
    }

    fn rollback(&self) {
        let log = &self.env.log;
        let result = self.env.connection.rollback_with(|| {
            let discarded = log.rollback();
            if discarded > 0 {
                debug!(entries = discarded, "Discarded flushed log entries");
            }
        });
        if let Err(e) = result {
            warn!(operation = self.command.name(), error = %e, "Rollback failed");
        }
    }

    /// Finalisation par commit, appelée une fois le latch à zéro
    fn finish_commit(&self) -> Result<SessionState> {
        let mut contexts = self.contexts.drain();

        if let Some(failure) = self.failure.get() {
            contexts.iter_mut().for_each(|ctx| {
                ctx.discard_all();
            });
            self.rollback();
            return Err(failure.clone());
        }

        let flushed: Result<()> = contexts
            .par_iter_mut()
            .map(|ctx| ctx.flush_all().map(|_| ()))
            .collect();
        drop(contexts);

        if let Err(e) = flushed {
            self.record_failure(&e);
            self.rollback();
            return Err(e);
        }

        if self.mode == TransactionMode::AutoRollback {
            self.rollback();
            return Ok(SessionState::Aborted);
        }

        let log = &self.env.log;
        match self.env.connection.commit_with(|| {
            log.commit();
        }) {
            Ok(()) => Ok(SessionState::Committed),
            Err(e) => {
                let e = OpsError::from(e);
                self.record_failure(&e);
                self.rollback();
                Err(e)
            }
        }
    }

    fn finish_abort(&self) {
        for mut ctx in self.contexts.drain() {
            ctx.discard_all();
        }
        self.rollback();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl<C: Command> Session<C> {
    pub fn new(command: C) -> Self {
        Self {
            command: Arc::new(command),
            lifecycle: RwLock::new(Lifecycle {
                state: SessionState::NotStarted,
                running: None,
                log: None,
                started_at: None,
                duration: None,
            }),
            failure: Arc::new(OnceLock::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn command(&self) -> &C {
        &self.command
    }

    /// Ouvre la connexion et démarre les workers
    ///
    /// Sans effet si la session est déjà démarrée.
    ///
    /// # Errors
    /// `AlreadyFinished` si la session est terminée; erreur de connexion ou
    /// de démarrage du pool (la session reste alors `NotStarted`).
    pub fn start(&self, adapter: &dyn DatabaseAdapter, options: SessionOptions) -> Result<()> {
        let mut lifecycle = self.lifecycle.write();
        match lifecycle.state {
            SessionState::Started => return Ok(()),
            state @ (SessionState::Committed | SessionState::Aborted) => {
                return Err(OpsError::AlreadyFinished(state))
            }
            SessionState::NotStarted => {}
        }

        let threads = options.threads.unwrap_or_else(default_threads).max(1);
        let max_batch_size = adapter.max_batch_size().max(1);
        let batch_size = options
            .batch_size
            .unwrap_or(max_batch_size)
            .clamp(1, max_batch_size);
        let queue_capacity = options.queue_capacity.unwrap_or(threads * 64);

        let connection = adapter.connect()?;
        let pool = WorkerPool::new(self.command.name(), threads, queue_capacity)?;
        let log = Arc::new(OperationLog::new(options.keep_log_entries));

        let env = Arc::new(WriterEnv {
            connection: Arc::new(SessionConnection::new(connection)),
            log: Arc::clone(&log),
            schema: adapter.schema().to_string(),
            srid: adapter.srid(),
            batch_size,
        });

        let shared = Arc::new(Shared {
            command: Arc::clone(&self.command),
            env,
            contexts: WorkerSlots::new(pool.size()),
            checkpoints: RwLock::new(()),
            latch: CountLatch::new(),
            failure: Arc::clone(&self.failure),
            counters: Arc::clone(&self.counters),
            should_continue: AtomicBool::new(true),
            mode: options.transaction_mode,
            applied: AtomicU64::new(0),
        });

        info!(
            operation = self.command.name(),
            threads = pool.size(),
            batch_size,
            mode = ?options.transaction_mode,
            "Session started"
        );

        lifecycle.running = Some(Running { shared, pool });
        lifecycle.log = Some(log);
        lifecycle.started_at = Some(Instant::now());
        lifecycle.state = SessionState::Started;
        Ok(())
    }

    /// Soumet un élément
    ///
    /// Bloque si la file du pool est pleine. Le handle retourné est déjà en
    /// erreur si la session n'est pas démarrée (`NotAllowed`) ou si un échec
    /// antérieur a annulé le travail (`Cancelled`).
    pub fn submit(&self, item: C::Item) -> Completion<C::Output> {
        let lifecycle = self.lifecycle.read();
        let Some(running) = lifecycle
            .running
            .as_ref()
            .filter(|_| lifecycle.state == SessionState::Started)
        else {
            return Completion::failed(OpsError::NotAllowed(lifecycle.state));
        };

        let shared = &running.shared;
        if !shared.should_continue.load(Ordering::SeqCst) {
            return Completion::failed(OpsError::Cancelled);
        }

        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        shared.latch.increment();

        let (completer, completion) = Completion::channel();
        let task_shared = Arc::clone(shared);
        let scheduled = running
            .pool
            .execute(Box::new(move |worker| task_shared.run(worker, item, completer)));

        match scheduled {
            Ok(()) => completion,
            Err(e) => {
                if let Err(latch_error) = shared.latch.decrement() {
                    error!(error = %latch_error, "Latch accounting error");
                }
                shared.record_failure(&e);
                Completion::failed(e)
            }
        }
    }

    /// Attend le travail en cours, flushe tous les lots et commite
    ///
    /// Idempotent sur une session terminée: retourne l'état final.
    /// En mode aperçu, tout est annulé et l'état final est `Aborted`.
    ///
    /// # Errors
    /// `NotStarted` si la session n'a jamais démarré. Le premier échec de la
    /// session (élément, flush ou commit) est retourné après rollback; la
    /// session est alors `Aborted`.
    pub fn commit_session(&self) -> Result<SessionState> {
        let mut lifecycle = self.lifecycle.write();
        match lifecycle.state {
            state @ (SessionState::Committed | SessionState::Aborted) => return Ok(state),
            SessionState::NotStarted => return Err(OpsError::NotStarted),
            SessionState::Started => {}
        }
        let Some(Running { shared, pool }) = lifecycle.running.take() else {
            return Err(OpsError::NotStarted);
        };

        shared.latch.wait();
        let result = shared.finish_commit();
        shared.should_continue.store(false, Ordering::SeqCst);
        pool.shutdown();
        drop(shared);

        lifecycle.state = match &result {
            Ok(state) => *state,
            Err(_) => SessionState::Aborted,
        };
        lifecycle.duration = lifecycle.started_at.map(|t| t.elapsed());

        let log = lifecycle.log.as_deref();
        match &result {
            Ok(state) => info!(
                operation = self.command.name(),
                state = %state,
                submitted = self.counters.submitted.load(Ordering::SeqCst),
                committed = log.map(|l| l.committed_count()).unwrap_or(0),
                "Session finished"
            ),
            Err(e) => warn!(
                operation = self.command.name(),
                error = %e,
                committed = log.map(|l| l.committed_count()).unwrap_or(0),
                "Session rolled back"
            ),
        }
        result
    }

    /// Attend le travail en cours puis annule tout ce qui n'est pas commité
    ///
    /// Idempotent sur une session terminée. Une session jamais démarrée
    /// passe directement à `Aborted`.
    pub fn abort_session(&self) -> Result<SessionState> {
        let mut lifecycle = self.lifecycle.write();
        match lifecycle.state {
            state @ (SessionState::Committed | SessionState::Aborted) => return Ok(state),
            SessionState::NotStarted => {
                lifecycle.state = SessionState::Aborted;
                return Ok(SessionState::Aborted);
            }
            SessionState::Started => {}
        }

        if let Some(Running { shared, pool }) = lifecycle.running.take() {
            shared.should_continue.store(false, Ordering::SeqCst);
            shared.latch.wait();
            shared.finish_abort();
            pool.shutdown();
        }

        lifecycle.state = SessionState::Aborted;
        lifecycle.duration = lifecycle.started_at.map(|t| t.elapsed());
        info!(operation = self.command.name(), "Session aborted");
        Ok(SessionState::Aborted)
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.read().state
    }

    /// Aucun échec enregistré
    ///
    /// Une session en aperçu terminée sans erreur reste "réussie" bien que
    /// son état final soit `Aborted`.
    pub fn was_successful(&self) -> bool {
        self.failure.get().is_none()
    }

    /// Premier échec enregistré
    pub fn first_failure(&self) -> Option<OpsError> {
        self.failure.get().cloned()
    }

    /// Les nouveaux éléments sont encore acceptés
    pub fn should_continue(&self) -> bool {
        let lifecycle = self.lifecycle.read();
        lifecycle
            .running
            .as_ref()
            .is_some_and(|r| r.shared.should_continue.load(Ordering::SeqCst))
    }

    /// Journal de la session (disponible après `start`)
    pub fn log(&self) -> Option<Arc<OperationLog>> {
        self.lifecycle.read().log.clone()
    }

    pub fn statistics(&self) -> Statistics {
        let lifecycle = self.lifecycle.read();
        let duration = lifecycle
            .duration
            .or_else(|| lifecycle.started_at.map(|t| t.elapsed()))
            .unwrap_or_default();
        let submitted = self.counters.submitted.load(Ordering::SeqCst);
        let failed = self.counters.failed.load(Ordering::SeqCst);
        match &lifecycle.log {
            Some(log) => Statistics::collect(log, submitted, failed, duration),
            None => Statistics::default(),
        }
    }
}

impl<C: Command> Drop for Session<C> {
    fn drop(&mut self) {
        if self.lifecycle.get_mut().state == SessionState::Started {
            warn!(operation = self.command.name(), "Session dropped while started, rolling back");
            if let Err(e) = self.abort_session() {
                error!(error = %e, "Implicit abort failed");
            }
        }
    }
}
