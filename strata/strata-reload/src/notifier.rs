//! Dedicated notifier context.
//!
//! Every deferred piece of work (data release callbacks, completion of client
//! futures, listener events) runs on one background task, in submission
//! order. Observers therefore never see events of one project interleaved
//! out of order.

use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Deferred unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle for submitting jobs to the notifier task.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Job>,
}

impl Notifier {
    /// Spawn the notifier task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Notifier job panicked");
                }
            }
            debug!("Notifier task stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue a job. When the notifier task is gone the job runs inline, so
    /// releases are never lost.
    pub fn submit(&self, job: Job) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            warn!("Notifier closed, running job inline");
            job();
        }
    }

    /// Queue several jobs that must run back to back.
    pub fn submit_all(&self, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        self.submit(Box::new(move || {
            for job in jobs {
                job();
            }
        }));
    }

    /// Wait until every job submitted before this call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move || {
            let _ = tx.send(());
        }));
        let _ = rx.await;
    }
}
