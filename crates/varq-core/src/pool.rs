//! Bounded thread pool.
//!
//! A fixed set of workers draining one FIFO queue of closures. The pool
//! width caps in-flight per-URL work, which in turn bounds peak memory;
//! that is why the worker count is a configuration knob rather than
//! scaling with the request. Shutdown enqueues one sentinel per worker;
//! there is no per-task cancellation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    // `None` is the shutdown sentinel.
    queue: Mutex<VecDeque<Option<Job>>>,
    work_available: Condvar,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(num_workers: usize) -> Self {
        assert!(num_workers > 0, "thread pool requires at least one worker");
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
        });
        let workers = (0..num_workers)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("varq-worker-{i}"))
                    .spawn(move || work_loop(shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();
        ThreadPool { shared, workers }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a closure for execution. FIFO per producer; no priorities.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(Some(Box::new(job)));
        self.shared.work_available.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            for _ in 0..self.workers.len() {
                queue.push_back(None);
            }
        }
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn work_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            while queue.is_empty() {
                shared.work_available.wait(&mut queue);
            }
            queue.pop_front().unwrap()
        };
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}
