//! Handle de résultat d'un élément soumis

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{OpsError, Result};

/// Résultat à venir d'un élément soumis
///
/// Se résout exactement une fois: valeur de la commande ou erreur. Peut être
/// attendu de façon bloquante ([`wait`](Self::wait)) ou avec `.await`.
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Côté producteur d'un [`Completion`]
#[derive(Debug)]
pub(crate) struct Completer<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(self, outcome: Result<T>) {
        // Handle abandonné par l'appelant
        let _ = self.tx.send(outcome);
    }
}

impl<T> Completion<T> {
    pub(crate) fn channel() -> (Completer<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (Completer { tx }, Self { rx })
    }

    /// Handle déjà résolu en erreur (soumission refusée)
    pub fn failed(error: OpsError) -> Self {
        let (completer, completion) = Self::channel();
        completer.complete(Err(error));
        completion
    }

    /// Attend le résultat en bloquant le thread courant
    ///
    /// Ne pas appeler depuis un contexte async: utiliser `.await`.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or(Err(OpsError::Dropped))
    }

    /// Résultat s'il est déjà disponible
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(OpsError::Dropped)),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(OpsError::Dropped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_returns_value() {
        let (completer, completion) = Completion::channel();
        std::thread::spawn(move || completer.complete(Ok(42)));
        assert_eq!(completion.wait().unwrap(), 42);
    }

    #[test]
    fn test_failed_completion() {
        let completion: Completion<()> = Completion::failed(OpsError::Cancelled);
        assert!(matches!(completion.wait(), Err(OpsError::Cancelled)));
    }

    #[test]
    fn test_dropped_completer() {
        let (completer, completion) = Completion::<u32>::channel();
        drop(completer);
        assert!(matches!(completion.wait(), Err(OpsError::Dropped)));
    }

    #[test]
    fn test_try_result() {
        let (completer, mut completion) = Completion::channel();
        assert!(completion.try_result().is_none());
        completer.complete(Ok("done"));
        assert_eq!(completion.try_result().unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_await_completion() {
        let (completer, completion) = Completion::channel();
        tokio::task::spawn_blocking(move || completer.complete(Ok(7u8)));
        assert_eq!(completion.await.unwrap(), 7);
    }
}
