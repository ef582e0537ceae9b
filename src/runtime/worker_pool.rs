//! Fixed-size worker pool for offloaded connection work.
//!
//! Each worker owns its own FIFO queue. Jobs are routed by key, so all jobs
//! submitted for the same key run on the same worker in submission order
//! and never overlap.
//!
//! Different keys still run in parallel as long as they map to different
//! workers. Keys that share a worker queue behind each other even when other
//! workers are idle. Jobs never block on I/O, so each wait is bounded by the
//! transforms queued ahead of it.

use crate::error::PoolError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::{Builder, JoinHandle};
use tracing::{debug, trace};

/// A unit of work executed on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Job(Job),
    Terminate,
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize, receiver: Receiver<WorkerMessage>) -> Result<Self, PoolError> {
        let thread = Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                debug!(worker = id, "Worker started");
                while let Ok(message) = receiver.recv() {
                    match message {
                        WorkerMessage::Job(job) => job(),
                        WorkerMessage::Terminate => break,
                    }
                }
                debug!(worker = id, "Worker stopped");
            })
            .map_err(|source| PoolError::Spawn { id, source })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }
}

/// Pool of long-lived worker threads.
pub struct WorkerPool {
    workers: Vec<Worker>,
    senders: Vec<Sender<WorkerMessage>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads (at least one).
    pub fn new(size: usize) -> Result<Self, PoolError> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let mut senders = Vec::with_capacity(size);

        for id in 0..size {
            let (sender, receiver) = unbounded();
            workers.push(Worker::spawn(id, receiver)?);
            senders.push(sender);
        }

        Ok(Self { workers, senders })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue `job` on the worker responsible for `key`.
    ///
    /// Never blocks. Jobs sharing a key execute in submission order.
    pub fn submit<F>(&self, key: usize, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = key % self.senders.len();
        trace!(key, worker = index, "Submitting job");
        self.senders[index]
            .send(WorkerMessage::Job(Box::new(job)))
            .map_err(|_| PoolError::Closed)
    }

    /// Let queued jobs finish, then stop and join every worker.
    pub fn shutdown(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Terminate);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    debug!(worker = worker.id, "Worker panicked");
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
