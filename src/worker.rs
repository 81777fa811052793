//! Bounded pool for fire-and-forget work.
//!
//! Operator actions (approve, update, rollback) are submitted here so the
//! caller returns immediately; results surface through the event publisher.
//! Each job runs in its own task, so a panicking job unwinds (and releases
//! its update lease) without taking a worker down.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use log::{debug, error};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};

type Job = BoxFuture<'static, ()>;

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if let Err(e) = tokio::spawn(job).await {
                            error!("Worker {} job aborted: {}", id, e);
                        }
                    }
                    debug!("Worker {} stopped", id);
                })
            })
            .collect();
        Self { tx, workers }
    }

    /// Queues a job without waiting. Fails when the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.try_send(Box::pin(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                EngineError::Runtime("worker queue full, try again later".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::Runtime("worker pool is shut down".into())
            }
        })
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
