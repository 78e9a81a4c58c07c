//! Single-consumer job queue that runs storage mutations one at a time.
//!
//! The index and ledger are whole-document read-modify-write, so every writer goes
//! through here. Callers get a [`Pending`] they may await or drop; dropping it does
//! not cancel the job.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use phivault_core::{Result, VaultError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone)]
pub struct SerialQueue {
    jobs: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Start the worker task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // Each job gets its own task so a panic fails that job only.
                if let Err(err) = tokio::spawn(job).await {
                    error!(error = %err, "queued job aborted");
                }
            }
            debug!("serial queue drained");
        });
        Self { jobs }
    }

    /// Queue `fut` behind everything already submitted. Returns immediately.
    pub fn enqueue<F, T>(&self, fut: F) -> Pending<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // Receiver gone means the caller stopped waiting; the work is still done.
            let _ = tx.send(fut.await);
        });
        if self.jobs.send(job).is_err() {
            error!("serial queue is closed");
        }
        Pending { rx }
    }

    /// Queue `fut` and wait for its result.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(fut).await
    }
}

/// Completion handle for a queued job.
pub struct Pending<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| VaultError::io("worker queue closed before job completed")))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let queue = SerialQueue::spawn();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for idx in 0..5u64 {
            let log = Arc::clone(&log);
            pending.push(queue.enqueue(async move {
                // Earlier jobs sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(10 * (5 - idx))).await;
                log.lock().unwrap().push(idx);
            }));
        }
        for p in pending {
            p.await.expect("job");
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let queue = SerialQueue::spawn();
        let (done_tx, done_rx) = oneshot::channel();

        drop(queue.enqueue(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = done_tx.send(());
        }));

        let value = queue.run(async { 7 }).await.expect("second job");
        assert_eq!(value, 7);
        done_rx.await.expect("first job still completed");
    }

    #[tokio::test]
    async fn panicking_job_fails_alone() {
        let queue = SerialQueue::spawn();
        let err = queue
            .run(async {
                panic!("boom");
            })
            .await
            .expect_err("panicked job");
        assert!(matches!(err, VaultError::IoFailure { .. }));

        assert_eq!(queue.run(async { "still alive" }).await.unwrap(), "still alive");
    }
}
