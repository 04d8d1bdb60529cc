//! Latch de comptage
//!
//! Compte le travail asynchrone en cours. N'importe quel thread peut
//! incrémenter; un thread peut attendre que le compteur revienne à zéro.
//! Contrairement à un `Barrier`, le latch est réutilisable: plusieurs vagues
//! d'incréments/décréments peuvent se succéder pendant qu'un autre thread
//! attend.

use parking_lot::{Condvar, Mutex};

use crate::error::{OpsError, Result};

/// Latch de comptage (mutex + condition)
#[derive(Debug, Default)]
pub struct CountLatch {
    count: Mutex<u64>,
    zero: Condvar,
}

impl CountLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signale une unité de travail à venir
    ///
    /// Doit être appelé avant de planifier le travail.
    pub fn increment(&self) {
        *self.count.lock() += 1;
    }

    /// Signale la fin d'une unité de travail (succès ou échec)
    ///
    /// # Errors
    /// `OpsError::LatchUnderflow` si le compteur est déjà à zéro; le
    /// compteur reste alors à zéro.
    pub fn decrement(&self) -> Result<()> {
        let mut count = self.count.lock();
        debug_assert!(*count > 0, "count latch decremented below zero");
        if *count == 0 {
            return Err(OpsError::LatchUnderflow);
        }
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
        Ok(())
    }

    /// Bloque jusqu'à ce que le compteur soit à zéro
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Valeur courante du compteur
    pub fn count(&self) -> u64 {
        *self.count.lock()
    }
}
