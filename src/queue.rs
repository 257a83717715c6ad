//! Fixed-size worker queue.
//!
//! A [`TaskQueue`] owns a set of worker threads fed from one bounded
//! channel. Submitting never blocks: when the channel is full the task is
//! handed back to the caller inside [`QueueError::Full`] and otherwise
//! dropped.
use std::{
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, SyncSender, TrySendError},
    },
    thread,
};

use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError<T> {
    #[error("unable to add task to queue: queue is full")]
    Full(T),
    #[error("unable to add task to queue: workers have stopped")]
    Closed(T),
}

impl<T> QueueError<T> {
    /// Recover the rejected task.
    pub fn into_inner(self) -> T {
        match self {
            QueueError::Full(task) | QueueError::Closed(task) => task,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Tasks that may wait before submissions start being refused.
    pub max_queue_size: usize,
    pub worker_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 50,
            worker_count: 1,
        }
    }
}

#[derive(Debug)]
pub struct TaskQueue<T: Send + 'static> {
    workers: Vec<Worker>,
    sender: Option<SyncSender<T>>,
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn start<F>(config: QueueConfig, work: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        assert!(config.worker_count > 0);

        let (sender, receiver) = mpsc::sync_channel(config.max_queue_size);
        let receiver = Arc::new(Mutex::new(receiver));
        let work = Arc::new(work);

        let workers = (0..config.worker_count)
            .map(|id| Worker::new(id, Arc::clone(&receiver), Arc::clone(&work)))
            .collect();

        Self {
            workers,
            sender: Some(sender),
        }
    }

    pub fn add_task(&self, task: T) -> Result<(), QueueError<T>> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(QueueError::Closed(task));
        };

        sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(task) => {
                warn!("task queue is full, rejecting task");
                QueueError::Full(task)
            }
            TrySendError::Disconnected(task) => QueueError::Closed(task),
        })
    }
}

impl<T: Send + 'static> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new<T, F>(id: usize, receiver: Arc<Mutex<Receiver<T>>>, work: Arc<F>) -> Self
    where
        T: Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let thread = thread::spawn(move || {
            loop {
                let msg = match receiver.lock() {
                    Ok(receiver) => receiver.recv(),
                    Err(poisoned) => poisoned.into_inner().recv(),
                };
                match msg {
                    Ok(task) => (*work)(task),
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }
}
