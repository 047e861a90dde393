//! Fixed worker pool for fire-and-forget background work. The event loop
//! hands over ownership of detached containers whose teardown would stall
//! a tick; workers drain a FIFO queue guarded by a mutex and condvar.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Work = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Work>,
    shutdown: bool,
}

pub struct ThreadPool {
    threads: Vec<thread::JoinHandle<()>>,
    queue: Arc<(Mutex<Queue>, Condvar)>,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        let queue = Arc::new((
            Mutex::new(Queue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let threads = (0..num_threads)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || worker_loop(&queue))
            })
            .collect();
        Self { threads, queue }
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let (lock, cvar) = &*self.queue;
        let mut q = lock.lock().unwrap();
        q.jobs.push_back(Box::new(job));
        cvar.notify_one();
    }
}

fn worker_loop(queue: &(Mutex<Queue>, Condvar)) {
    let (lock, cvar) = queue;
    loop {
        let job = {
            let mut q = lock.lock().unwrap();
            while q.jobs.is_empty() && !q.shutdown {
                q = cvar.wait(q).unwrap();
            }
            match q.jobs.pop_front() {
                Some(job) => job,
                // Queue drained and shutdown requested.
                None => return,
            }
        };
        job();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let (lock, cvar) = &*self.queue;
            lock.lock().unwrap().shutdown = true;
            cvar.notify_all();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (lock, _) = &*self.queue;
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.threads.len())
            .field("queue_len", &lock.lock().unwrap().jobs.len())
            .finish()
    }
}
