//! A minimal scoped worker pool: jobs are sent over a channel and picked up
//! by a fixed set of threads that live as long as the scope.  Used by the
//! evaluator, whose jobs borrow the computation functions.

use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;

type Job<'a> = Box<dyn FnOnce() + Send + 'a>;

pub struct ThreadPoolExecutor<'a> {
    sender: mpsc::Sender<Job<'a>>,
    num_threads: NonZeroUsize,
}

impl<'a> ThreadPoolExecutor<'a> {
    pub fn execute<F: FnOnce() + Send + 'a>(&self, f: F) {
        // The receiver lives until the scope ends, so this only fails if every
        // worker panicked; the job is dropped in that case.
        let _ = self.sender.send(Box::new(f));
    }

    pub fn num_threads(&self) -> NonZeroUsize {
        self.num_threads
    }
}

/// Runs `scope` with a pool of `num_threads` workers.  All queued jobs finish
/// before this returns.
pub fn scoped_thread_pool<'env, T, F>(num_threads: NonZeroUsize, scope: F) -> T
where
    F: FnOnce(&ThreadPoolExecutor<'env>) -> T,
{
    std::thread::scope(|s| {
        let (sender, receiver) = mpsc::channel::<Job<'env>>();
        let receiver = Arc::new(Mutex::new(receiver));

        for _ in 0..num_threads.get() {
            let receiver = receiver.clone();
            s.spawn(move || loop {
                let message = receiver.lock().recv();
                match message {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            });
        }

        let pool = ThreadPoolExecutor {
            sender,
            num_threads,
        };
        let result = scope(&pool);
        // Dropping the sender lets the workers exit once the queue drains.
        drop(pool);
        result
    })
}
