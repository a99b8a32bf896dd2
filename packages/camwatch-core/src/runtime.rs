//! Where ONVIF discovery runs and device polls execute.
//!
//! The ONVIF manager never blocks its caller: every discovery run and every
//! device poll is handed to a [`TaskSpawner`] as a one-shot future which
//! reports back into the manager when done. Embedders that already own a
//! runtime pass its handle; the scanner binary uses the current Tokio runtime.

use std::future::Future;

/// Launches fire-and-forget background work.
///
/// Spawned work is never joined or cancelled. Stale results are discarded by
/// the manager's generation check instead.
pub trait TaskSpawner: Send + Sync {
    /// Runs `future` to completion in the background.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Spawns onto a Tokio runtime through its handle.
///
/// Holding a handle rather than relying on the ambient context lets the
/// manager be driven from threads that are not runtime workers, such as a
/// UI thread calling `active_search`.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is currently inside.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[tokio::test]
    async fn current_spawner_runs_task() {
        let spawner = TokioSpawner::current();
        let (tx, rx) = tokio::sync::oneshot::channel();

        spawner.spawn(async move {
            let _ = tx.send(7);
        });

        assert_eq!(rx.await.unwrap(), 7);
    }

    #[test]
    fn handle_spawner_works_from_foreign_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let spawner = TokioSpawner::new(runtime.handle().clone());
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            spawner.spawn(async move {
                let _ = tx.send("polled");
            });
        })
        .join()
        .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "polled");
    }
}
