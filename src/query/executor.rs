//! The query worker pool: a fixed set of threads consuming tasks from a
//! bounded queue.
//!
//! `try_post` never blocks; when the queue is full the caller runs the task
//! inline. That fallback is what prevents self-deadlock when the consumer
//! thread is also the producer.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::debug;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct Executor {
    sender: Option<SyncSender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl Executor {
    pub fn new(threads: usize, queue_capacity: usize) -> Executor {
        let threads = threads.max(1);
        let (sender, receiver) = sync_channel::<Task>(queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..threads)
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("query-worker-{i}"))
                    .spawn(move || worker_loop(&receiver))
                    .expect("spawn query worker")
            })
            .collect();
        debug!(threads, queue_capacity, "query executor started");
        Executor {
            sender: Some(sender),
            workers,
        }
    }

    /// Posts a task unless the queue is full; on saturation the task is
    /// handed back for inline execution.
    pub fn try_post(&self, task: Task) -> std::result::Result<(), Task> {
        let sender = self.sender.as_ref().expect("executor is running");
        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => Err(task),
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Task>>) {
    loop {
        let task = {
            let guard = receiver.lock();
            guard.recv()
        };
        match task {
            Ok(task) => task(),
            Err(_) => break,
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Disconnect the channel; workers exit once the queue drains.
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
