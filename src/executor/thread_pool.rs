use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use crate::engine::{Engine, RunRequest, SyncEngine};
use crate::error::TaskError;
use crate::future::{Backend, Completion, RunFuture};
use crate::state::State;

use super::TaskRunner;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submissions on a fixed pool of worker threads.
///
/// Workers pull runs from a shared queue and drive each one with the
/// blocking engine. Dropping the runner lets queued runs finish, then
/// joins the workers.
///
/// A run that waits on futures of runs queued behind it on the same pool
/// can deadlock once every worker is blocked that way. Size the pool for
/// the nesting depth of such flows.
pub struct ThreadPoolTaskRunner {
    engine: Engine,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolTaskRunner {
    pub fn new(engine: Engine, workers: usize) -> Self {
        let size = workers.max(1);
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .filter_map(|i| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("flowrunner-worker-{}", i))
                    .spawn(move || worker_loop(receiver))
                    .map_err(|e| error!("Could not start worker {}: {}", i, e))
                    .ok()
            })
            .collect::<Vec<_>>();

        info!("Started thread pool runner with {} workers", workers.len());
        Self {
            engine,
            sender: Mutex::new(Some(sender)),
            workers,
        }
    }

    /// A pool sized by `settings.runner.max_workers`, or the CPU count.
    pub fn from_settings(engine: Engine) -> Self {
        let workers = engine.settings().runner.workers();
        Self::new(engine, workers)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = match receiver.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => return,
        };
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

impl TaskRunner for ThreadPoolTaskRunner {
    fn name(&self) -> &str {
        "thread-pool"
    }

    fn submit_request(&self, request: RunRequest) -> RunFuture {
        let run_id = request.run_id();
        let completion = Arc::new(Completion::new());
        let future = RunFuture::new(
            run_id,
            Arc::clone(&completion),
            Backend::Thread {
                cancel: request.cancel_token().clone(),
            },
        );

        let engine = SyncEngine::new(self.engine.clone());
        let slot = Arc::clone(&completion);
        let job: Job = Box::new(move || {
            let state = catch_unwind(AssertUnwindSafe(|| engine.run(request))).unwrap_or_else(|_| {
                State::crashed(TaskError::crash("Run driver panicked"))
            });
            slot.complete(state);
        });

        let sent = match self.sender.lock() {
            Ok(sender) => sender.as_ref().map(|s| s.send(job).is_ok()).unwrap_or(false),
            Err(_) => false,
        };
        if !sent {
            error!("Thread pool is shut down; run {} not started", run_id);
            completion.complete(State::crashed(TaskError::crash(
                "Task runner is shut down",
            )));
        } else {
            debug!("Queued run {} on thread pool", run_id);
        }
        future
    }
}

impl Drop for ThreadPoolTaskRunner {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}
