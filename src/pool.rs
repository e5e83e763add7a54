//! Background worker pool.
//!
//! A fixed-width pool of plain OS threads used to parallelize independent
//! page writes (the zeroing passes of rewrites) and to run scheduled
//! reorganizations off the flush path. `submit` returns a handle that can
//! be waited on; `spawn` is fire-and-forget.
//!
//! Dropping the pool lets the workers drain every queued job and joins
//! them, so callers can rely on scheduled work having run once the pool is
//! gone.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{eyre, Result};
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<State>,
    available: Condvar,
}

struct State {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

/// A waitable result of a submitted task.
pub struct TaskHandle<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task completes. Fails if the task panicked.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| eyre!("background task dropped its result"))
    }
}

impl ThreadPool {
    pub fn new(threads: usize) -> ThreadPool {
        assert!(threads > 0, "thread pool needs at least one worker");
        let shared = Arc::new(Shared {
            queue: Mutex::new(State {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let workers = (0..threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("linekv-bg-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn background worker")
            })
            .collect();
        ThreadPool { shared, workers }
    }

    /// Runs `f` on a worker and returns a handle for its result.
    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.enqueue(Box::new(move || {
            let _ = tx.send(f());
        }));
        TaskHandle { rx }
    }

    /// Runs `f` on a worker without a way to observe completion.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(f));
    }

    fn enqueue(&self, job: Job) {
        let mut state = self.shared.queue.lock();
        debug_assert!(!state.shutdown);
        state.jobs.push_back(job);
        drop(state);
        self.shared.available.notify_one();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.queue.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                shared.available.wait(&mut state);
            }
        };
        job();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
