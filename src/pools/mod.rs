use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, PartialEq, Eq)]
pub enum TaskError {
    Failed { label: String, message: String },
    Panicked { label: String, message: String },
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { label, message } => write!(f, "task '{label}' failed: {message}"),
            Self::Panicked { label, message } => write!(f, "task '{label}' panicked: {message}"),
        }
    }
}

impl std::error::Error for TaskError {}

#[derive(Default)]
struct PoolQueue {
    jobs: VecDeque<Job>,
    accepting: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
    logger: Arc<Logger>,
}

/// Fixed set of worker threads pulling closures from one unbounded FIFO.
///
/// A submitted task's `on_success` callback runs on the worker only when the
/// task returns `Ok`. Errors and panics are logged and the callback is
/// skipped, so a client waiting on that response sees nothing.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize, logger: Arc<Logger>) -> io::Result<Self> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                accepting: true,
            }),
            available: Condvar::new(),
            logger,
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("pool-worker-{index}"))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn queued(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("worker pool queue lock poisoned")
            .jobs
            .len()
    }

    pub fn is_accepting(&self) -> bool {
        self.shared
            .queue
            .lock()
            .expect("worker pool queue lock poisoned")
            .accepting
    }

    /// Queues `task`. Returns `false` (after logging) when the pool is shut down.
    pub fn submit<T, E, F, C>(&self, label: &str, task: F, on_success: C) -> bool
    where
        T: 'static,
        E: fmt::Display + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        let label = label.to_owned();
        let logger = Arc::clone(&self.shared.logger);
        let job: Job = Box::new(move || match run_task(&label, task) {
            Ok(value) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_success(value))) {
                    logger.log(
                        LogLevel::Error,
                        Some("pools::worker"),
                        "Task success callback panicked",
                        Some(json!({"task": label, "panic": panic_message(payload.as_ref())})),
                    );
                }
            }
            Err(error) => {
                logger.log(
                    LogLevel::Warn,
                    Some("pools::worker"),
                    "Task did not complete; response skipped",
                    Some(json!({"task": label, "error": error.to_string()})),
                );
            }
        });

        let mut queue = self
            .shared
            .queue
            .lock()
            .expect("worker pool queue lock poisoned");
        if !queue.accepting {
            drop(queue);
            self.shared.logger.warn(
                Some("pools::submit"),
                "Submission ignored because the worker pool is shut down",
            );
            return false;
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        true
    }

    /// Stops accepting work, lets queued tasks drain and joins the workers.
    /// Later calls return immediately.
    pub fn shutdown(&self) {
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .expect("worker pool queue lock poisoned");
            queue.accepting = false;
        }
        self.shared.available.notify_all();

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .expect("worker pool handles lock poisoned")
            .drain(..)
            .collect();
        if workers.is_empty() {
            return;
        }

        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        self.shared.logger.log(
            LogLevel::Info,
            Some("pools::shutdown"),
            "Worker pool drained and stopped",
            Some(json!({"workers": self.size})),
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("worker pool queue lock poisoned");
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if !queue.accepting {
                    break None;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .expect("worker pool queue lock poisoned");
            }
        };

        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

fn run_task<T, E, F>(label: &str, task: F) -> Result<T, TaskError>
where
    E: fmt::Display,
    F: FnOnce() -> Result<T, E>,
{
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(TaskError::Failed {
            label: label.to_owned(),
            message: error.to_string(),
        }),
        Err(payload) => Err(TaskError::Panicked {
            label: label.to_owned(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
