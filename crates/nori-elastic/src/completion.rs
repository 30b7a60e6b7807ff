//! Result delivery for queued tasks.
//!
//! Every accepted operation hands back a [`Completion`]. It resolves once a
//! worker has executed the task, with the engine's result or with
//! [`Error::TaskDropped`] if the task was discarded without an answer.

use crate::error::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Pending result of a queued task.
///
/// Await it from async code, or call [`Completion::wait`] from a plain
/// thread.
#[must_use = "a Completion does nothing unless awaited or waited on"]
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Sending half, carried inside the task.
#[derive(Debug)]
pub(crate) struct Responder<T> {
    tx: oneshot::Sender<Result<T>>,
}

pub(crate) fn channel<T>() -> (Responder<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Responder { tx }, Completion { rx })
}

impl<T> Responder<T> {
    /// Delivers `result`. Returns false if the caller already dropped its
    /// [`Completion`].
    pub(crate) fn send(self, result: Result<T>) -> bool {
        self.tx.send(result).is_ok()
    }
}

impl<T> Completion<T> {
    /// Blocks the current thread until the task finishes.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous runtime; use `.await`
    /// there instead.
    pub fn wait(self) -> Result<T> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(Error::TaskDropped),
        }
    }

    /// Non-blocking check. `None` while the task is still queued or running.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::TaskDropped)),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(Error::TaskDropped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_receives_result() {
        let (responder, completion) = channel::<u32>();
        thread::spawn(move || {
            responder.send(Ok(42));
        });
        assert_eq!(completion.wait().unwrap(), 42);
    }

    #[test]
    fn test_dropped_responder_reports_task_dropped() {
        let (responder, completion) = channel::<()>();
        drop(responder);
        assert!(matches!(completion.wait(), Err(Error::TaskDropped)));
    }

    #[test]
    fn test_send_after_completion_dropped() {
        let (responder, completion) = channel::<()>();
        drop(completion);
        assert!(!responder.send(Ok(())));
    }

    #[test]
    fn test_try_take() {
        let (responder, mut completion) = channel::<&'static str>();
        assert!(completion.try_take().is_none());
        responder.send(Err(Error::engine("boom")));
        assert!(matches!(completion.try_take(), Some(Err(Error::Engine(_)))));
    }

    #[tokio::test]
    async fn test_await_completion() {
        let (responder, completion) = channel::<Vec<u8>>();
        thread::spawn(move || {
            responder.send(Ok(b"value".to_vec()));
        });
        assert_eq!(completion.await.unwrap(), b"value".to_vec());
    }
}
