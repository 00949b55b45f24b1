//! Serialized execution context for transport writes
//!
//! Jobs posted to a [`Strand`] run one at a time, in posting order, on a
//! single tokio task. The audio callback posts its datagram writes here and
//! never touches the transport itself.

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::NetworkError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Posting end of a serialized job queue
#[derive(Clone)]
pub struct Strand {
    jobs: mpsc::UnboundedSender<Job>,
}

impl Strand {
    /// Start a strand on the given runtime
    pub fn spawn(handle: &Handle) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();

        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!("Strand closed");
        });

        Self { jobs }
    }

    /// Start a strand on the runtime of the calling thread
    pub fn current() -> Result<Self, NetworkError> {
        let handle = Handle::try_current()
            .map_err(|e| NetworkError::ConnectionFailed(format!("No tokio runtime: {}", e)))?;
        Ok(Self::spawn(&handle))
    }

    /// Queue `job` behind everything posted so far.
    ///
    /// Never blocks. Returns `false` when the strand's task is gone, in which
    /// case the job is dropped without running.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs.send(Box::new(job)).is_ok()
    }

    /// Wait until every job posted before this call has run
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.post(move || {
            let _ = done.send(());
        }) {
            let _ = wait.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}
