//! Background worker gate
//!
//! Fire-and-forget work (cache writes, presign refreshes, revalidations)
//! is handed to the host's wait-until-completion facility when one exists.
//! `spawn` returns whether the work was accepted; on `false` the caller
//! must run the work inline or drop it. Spawned work never extends response
//! latency and its errors are logged, never propagated.

use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::ServiceError;

pub trait BackgroundGate: Send + Sync {
    /// Hand work to the background facility. Returns `true` when accepted.
    fn spawn(&self, label: &'static str, work: BoxFuture<'static, Result<(), ServiceError>>)
        -> bool;
}

/// Tokio-backed gate. Work is bounded by a deadline derived from the
/// request lifetime; completed handles are retained so tests and graceful
/// shutdown can drain them.
pub struct TokioGate {
    deadline: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioGate {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Await every spawned task. Used by tests and shutdown paths.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.handles.lock().len()
    }
}

impl BackgroundGate for TokioGate {
    fn spawn(
        &self,
        label: &'static str,
        work: BoxFuture<'static, Result<(), ServiceError>>,
    ) -> bool {
        let deadline = self.deadline;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(deadline, work).await {
                Ok(Ok(())) => {
                    tracing::debug!(task = label, "background task completed");
                }
                Ok(Err(err)) => {
                    tracing::warn!(task = label, error = %err, "background task failed");
                }
                Err(_) => {
                    tracing::warn!(
                        task = label,
                        deadline_secs = deadline.as_secs(),
                        "background task hit its deadline"
                    );
                }
            }
        });
        self.handles.lock().push(handle);
        crate::metrics::ProxyMetrics::global()
            .background_tasks
            .with_label_values(&["spawned"])
            .inc();
        true
    }
}

/// Gate for hosts with no background facility: work is refused and the
/// caller decides whether to run it inline or drop it.
pub struct NoopGate;

impl BackgroundGate for NoopGate {
    fn spawn(
        &self,
        label: &'static str,
        _work: BoxFuture<'static, Result<(), ServiceError>>,
    ) -> bool {
        tracing::debug!(task = label, "no background facility, work dropped");
        crate::metrics::ProxyMetrics::global()
            .background_tasks
            .with_label_values(&["dropped"])
            .inc();
        false
    }
}
