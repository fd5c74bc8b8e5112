//! Bounded worker pool for heavy build jobs.
//!
//! A fixed set of worker threads drains a rendezvous channel, so submitting
//! a job blocks the caller until a worker is free. The scheduler only
//! dispatches leaf work here; dependency coordination runs on plain threads
//! and never occupies a slot, which keeps a wide graph from deadlocking the
//! pool on dependency waits.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<mpsc::SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn a pool with `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::sync_channel::<Job>(0);
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size)
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("kiln-worker-{}", i))
                    .spawn(move || loop {
                        let job = {
                            let guard = receiver.lock().expect("worker receiver poisoned");
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { sender: Some(sender), workers }
    }

    /// Submit a job, blocking while every worker is busy. Returns a one-shot
    /// receiver for the job's result.
    pub fn submit<F, T>(&self, job: F) -> mpsc::Receiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let wrapped: Job = Box::new(move || {
            let _ = result_tx.send(job());
        });
        self.sender
            .as_ref()
            .expect("pool has been shut down")
            .send(wrapped)
            .expect("all workers exited");
        result_rx
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets idle workers observe the hangup.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
