//! Bounded worker pool with graceful drain.
//!
//! Backs the authorization manager: resolver calls are queued here so the
//! HTTP I/O workers never run cache/SQL work inline.

use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker pool queue is full")]
    Full,

    #[error("worker pool is stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    stopped: AtomicBool,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(num_workers: usize, queue_capacity: usize) -> WorkerPool {
        let num_workers = num_workers.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        let workers = (0..num_workers)
            .map(|_| {
                let receiver = receiver.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    loop {
                        // Workers exit only once the channel is closed AND
                        // drained: recv() yields None in exactly that state.
                        let job = {
                            let mut rx = receiver.lock().await;
                            rx.recv().await
                        };
                        let Some(job) = job else { break };

                        match std::panic::AssertUnwindSafe(job).catch_unwind().await {
                            Ok(()) => {
                                counters.completed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                error!("worker task panicked");
                            }
                        }
                    }
                })
            })
            .collect();

        info!(num_workers, "worker pool started");
        WorkerPool {
            sender: Mutex::new(Some(sender)),
            stopped: AtomicBool::new(false),
            counters,
            workers: Mutex::new(workers),
        }
    }

    pub fn submit<F>(&self, future: F) -> Result<(), SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::Stopped);
        }

        let sender = {
            let guard = self.sender.lock().expect("sender lock");
            guard.clone()
        };
        let Some(sender) = sender else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::Stopped);
        };

        match sender.try_send(Box::pin(future)) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(SubmitError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(SubmitError::Stopped)
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop accepting work and drain what was already queued.
    ///
    /// Waits until everything submitted before the stop instant has finished
    /// (or the timeout elapses; `Duration::ZERO` waits indefinitely), then
    /// joins the workers. On timeout the remaining workers are aborted so
    /// teardown always completes.
    pub async fn stop_and_wait(&self, timeout: Duration) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        // Closing the channel is the drain signal: workers finish the
        // queued backlog and then observe the closed channel.
        {
            let mut guard = self.sender.lock().expect("sender lock");
            guard.take();
        }

        let target = self.counters.submitted.load(Ordering::Acquire);
        let start = std::time::Instant::now();
        let mut drained = false;
        loop {
            let finished = self.counters.completed.load(Ordering::Relaxed)
                + self.counters.failed.load(Ordering::Relaxed);
            if finished >= target {
                drained = true;
                break;
            }
            if !timeout.is_zero() && start.elapsed() >= timeout {
                warn!(
                    outstanding = target - finished,
                    "worker pool drain timed out, forcing teardown"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().expect("workers lock");
            guard.drain(..).collect()
        };
        for handle in handles {
            if !drained {
                handle.abort();
            }
            let _ = handle.await;
        }

        let stats = self.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            rejected = stats.rejected,
            "worker pool stopped"
        );
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}
