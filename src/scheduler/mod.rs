use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Error, Result};

/// How long `drain` sleeps on the condition variable before looking for
/// queued work it can run itself.
const DRAIN_RECHECK: Duration = Duration::from_millis(10);

/// A unit of background I/O.
pub trait Task: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// Execute the task
    fn run(&self) -> Result<()>;
}

struct Shared {
    outstanding: Mutex<usize>,
    idle: Condvar,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl Shared {
    fn begin(&self) -> Result<()> {
        *self.outstanding.lock()? += 1;
        Ok(())
    }

    fn finish(&self) {
        let mut outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    /// Runs `task` to completion, logging failures. The outstanding counter
    /// is decremented even when the task panics.
    fn run(&self, task: Arc<dyn Task>) {
        match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(Ok(())) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(task = task.name(), error = %e, "Task execution failed");
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(task = task.name(), "Task panicked");
            }
        }
        self.finish();
    }
}

/// Fixed pool of worker threads pulling tasks off a shared queue.
///
/// With zero workers nothing runs in the background and queued tasks are
/// only executed by [`Scheduler::drain`] on the calling thread.
pub struct Scheduler {
    sender: Mutex<Option<Sender<Arc<dyn Task>>>>,
    receiver: Receiver<Arc<dyn Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(worker_threads: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Arc<dyn Task>>();
        let shared = Arc::new(Shared {
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(worker_threads);
        for i in 0..worker_threads {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("chunk-io-{}", i))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        shared.run(task);
                    }
                    tracing::debug!(worker = i, "Worker shutting down");
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(workers),
            shared,
        })
    }

    /// Queues `task` for a worker. Never blocks on I/O.
    pub fn enqueue(&self, task: Arc<dyn Task>) -> Result<()> {
        let sender = self.sender.lock()?;
        let sender = sender
            .as_ref()
            .ok_or_else(|| Error::InvalidState("scheduler is shut down".to_string()))?;

        self.shared.begin()?;
        if sender.send(task).is_err() {
            self.shared.finish();
            return Err(Error::InvalidState("task queue disconnected".to_string()));
        }
        Ok(())
    }

    /// Tasks queued or running.
    pub fn outstanding(&self) -> Result<usize> {
        Ok(*self.shared.outstanding.lock()?)
    }

    pub fn completed(&self) -> usize {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Blocks until no task is queued or running. Queued tasks are run on
    /// the calling thread while it waits.
    pub fn drain(&self) -> Result<()> {
        loop {
            while let Ok(task) = self.receiver.try_recv() {
                self.shared.run(task);
            }

            let outstanding = self.shared.outstanding.lock()?;
            if *outstanding == 0 {
                return Ok(());
            }
            let (outstanding, _) = self.shared.idle.wait_timeout(outstanding, DRAIN_RECHECK)?;
            if *outstanding == 0 {
                return Ok(());
            }
        }
    }

    /// Stops accepting tasks, runs what is left, and joins the workers.
    pub fn shutdown(&self) -> Result<()> {
        self.drain()?;
        self.sender.lock()?.take();

        let workers: Vec<_> = self.workers.lock()?.drain(..).collect();
        for worker in workers {
            worker
                .join()
                .map_err(|_| Error::InvalidState("worker thread panicked".to_string()))?;
        }

        // Anything enqueued between the drain and closing the queue.
        while let Ok(task) = self.receiver.try_recv() {
            self.shared.run(task);
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Scheduler shutdown failed");
        }
    }
}
