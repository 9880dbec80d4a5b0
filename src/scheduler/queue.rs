//! One logical work queue: bounded worker pool + bounded FIFO waiting list.
//!
//! Worker lifecycle per submission:
//! Idle → Claimed (permit acquired) → Running (backend call begun) →
//! Draining (cancellation requested) → Idle. A claimed worker whose backend
//! reports not-ready returns to Idle without being marked broken.
//!
//! The permit and the running counter are owned by a supervisor task, never
//! by the caller's future: a client that disconnects mid-call cannot free a
//! worker while the backend is still executing on it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::backends::ModelError;

use super::InferenceError;

/// Snapshot of one queue.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub name: &'static str,
    pub running: usize,
    pub waiting: usize,
    pub capacity: usize,
    pub overloaded: bool,
}

pub struct Queue {
    name: &'static str,
    capacity: usize,
    wait_cap: usize,
    wait_budget: Duration,
    sem: Arc<Semaphore>,
    running: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
    next_ticket: AtomicU64,
    closed: CancellationToken,
}

impl Queue {
    pub fn new(
        name: &'static str,
        capacity: usize,
        wait_cap: usize,
        wait_budget: Duration,
    ) -> Self {
        Self {
            name,
            capacity,
            wait_cap,
            wait_budget,
            sem: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
            next_ticket: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> QueueStatus {
        let waiting = self.waiting.load(Ordering::SeqCst);
        let running = self.running.load(Ordering::SeqCst);
        // With no waiting list at all, saturation means every worker busy.
        let overloaded = if self.wait_cap == 0 {
            running >= self.capacity
        } else {
            waiting >= self.wait_cap
        };
        QueueStatus {
            name: self.name,
            running,
            waiting,
            capacity: self.capacity,
            overloaded,
        }
    }

    /// Stop accepting submissions and fail every waiter with `cancelled`.
    pub fn close(&self) {
        self.closed.cancel();
        self.sem.close();
    }

    /// Wait for running work to finish, up to `deadline`.
    pub async fn drain_until(&self, deadline: tokio::time::Instant) {
        while self.running.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    queue = self.name,
                    running = self.running.load(Ordering::SeqCst),
                    "Drain period elapsed with work still running"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Submit blocking backend work.
    ///
    /// Admission: run immediately if a worker is idle; otherwise join the
    /// FIFO waiting list if it has room; otherwise fail fast with `busy`.
    /// `cancel` covers both explicit caller aborts and deadline tokens:
    /// cancelled-while-waiting never contacts the backend, and
    /// cancelled-while-running lets unary work finish and discards the
    /// result rather than corrupting the worker.
    pub async fn submit<T, F>(
        &self,
        cancel: CancellationToken,
        work: F,
    ) -> Result<T, InferenceError>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T, ModelError> + Send + 'static,
    {
        if self.closed.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }
        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;

        let permit = match self.sem.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(InferenceError::Cancelled),
            Err(TryAcquireError::NoPermits) => {
                let Some(_wait_guard) = WaitGuard::enter(&self.waiting, self.wait_cap) else {
                    tracing::debug!(queue = self.name, ticket, "Waiting list full, rejecting");
                    return Err(self.busy());
                };

                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(queue = self.name, ticket, "Cancelled while waiting");
                        return Err(InferenceError::Cancelled);
                    }
                    acquired = tokio::time::timeout(self.wait_budget, self.sem.clone().acquire_owned()) => {
                        match acquired {
                            Ok(Ok(permit)) => permit,
                            // Semaphore closed: shutdown cancelled the waiters.
                            Ok(Err(_)) => return Err(InferenceError::Cancelled),
                            Err(_) => {
                                tracing::debug!(queue = self.name, ticket, "Wait budget exhausted");
                                return Err(self.busy());
                            }
                        }
                    }
                }
            }
        };

        // Claimed. The supervisor below owns the permit and the running
        // counter for the rest of the lifecycle.
        tracing::trace!(queue = self.name, ticket, "Worker claimed");

        let (done_tx, done_rx) = oneshot::channel();
        let running = Arc::clone(&self.running);
        let worker_cancel = cancel.clone();
        let queue_name = self.name;

        tokio::spawn(async move {
            running.fetch_add(1, Ordering::SeqCst);
            let result =
                tokio::task::spawn_blocking(move || work(&worker_cancel)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            drop(permit);

            let outcome = match result {
                Ok(outcome) => outcome.map_err(InferenceError::from),
                Err(join_err) => {
                    tracing::error!(queue = queue_name, ticket, error = %join_err, "Worker panicked");
                    Err(InferenceError::Runtime(format!(
                        "worker failed: {join_err}"
                    )))
                }
            };
            // Receiver gone means the submitter stopped caring; the result
            // is discarded, the worker is already free.
            let _ = done_tx.send(outcome);
        });

        match done_rx.await {
            Ok(result) => {
                if cancel.is_cancelled() {
                    // Unary work that outran its cancellation: the backend
                    // finished cleanly, the caller gets `cancelled`.
                    tracing::debug!(queue = self.name, ticket, "Result discarded after cancellation");
                    return Err(InferenceError::Cancelled);
                }
                result
            }
            Err(_) => Err(InferenceError::Runtime(
                "worker result channel dropped".to_string(),
            )),
        }
    }

    fn busy(&self) -> InferenceError {
        // Rough hint: one wait-budget share per queued submission ahead.
        let depth = self.waiting.load(Ordering::SeqCst).max(1) as u64;
        InferenceError::Busy {
            retry_after_secs: (5 * depth).min(60),
        }
    }
}

/// RAII slot in the waiting list. Entering fails when the list is full;
/// dropping the guard releases the slot on every exit path.
struct WaitGuard<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> WaitGuard<'a> {
    fn enter(waiting: &'a AtomicUsize, cap: usize) -> Option<Self> {
        waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                if w >= cap {
                    None
                } else {
                    Some(w + 1)
                }
            })
            .ok()?;
        Some(Self { waiting })
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}
