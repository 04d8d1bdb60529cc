//! Pool de workers à threads OS
//!
//! Nombre fixe de threads partageant une file bornée. Chaque tâche reçoit
//! l'index du worker qui l'exécute: les ressources par worker (contextes,
//! finders) sont indexées par cet entier plutôt que stockées en TLS.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{OpsError, Result};

/// Tâche exécutée par un worker, avec l'index du worker
pub type Task = Box<dyn FnOnce(usize) + Send + 'static>;

/// Nombre de threads par défaut: `max(2, parallélisme disponible)`
pub fn default_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

/// Pool de workers borné
pub struct WorkerPool {
    name: String,
    sender: Option<SyncSender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Démarre `threads` workers et une file de `queue_capacity` tâches
    ///
    /// # Errors
    /// `OpsError::Pool` si un thread ne peut pas être créé; les threads déjà
    /// démarrés sont arrêtés.
    pub fn new(name: &str, threads: usize, queue_capacity: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Task>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut pool = Self {
            name: name.to_string(),
            sender: Some(sender),
            workers: Vec::with_capacity(threads),
        };

        for index in 0..threads {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(index, receiver))
                .map_err(|e| OpsError::Pool(format!("failed to spawn worker {name}-{index}: {e}")))?;
            pool.workers.push(handle);
        }

        debug!(pool = name, threads, queue_capacity, "Worker pool started");
        Ok(pool)
    }

    /// Nombre de workers
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Planifie une tâche
    ///
    /// Bloque si la file est pleine (backpressure sur le producteur).
    pub fn execute(&self, task: Task) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| OpsError::Pool(format!("pool {} is shut down", self.name)))?;
        sender
            .send(task)
            .map_err(|_| OpsError::Pool(format!("pool {} has no running worker", self.name)))
    }

    /// Ferme la file et attend la fin des workers
    ///
    /// Les tâches déjà en file sont exécutées avant l'arrêt.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        drop(self.sender.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(pool = %self.name, "Worker thread terminated with a panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(index: usize, receiver: Arc<Mutex<Receiver<Task>>>) {
    loop {
        let task = {
            let receiver = receiver.lock();
            receiver.recv()
        };
        match task {
            Ok(task) => task(index),
            Err(_) => break,
        }
    }
}
