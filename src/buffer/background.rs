//! Background maintenance: the worker pool and single-flight task gates.
//!
//! Memory cleaning and storage defrag run on a small pool of named threads
//! fed through a bounded channel. A [`SingleFlight`] per task kind keeps at
//! most one instance scheduled or running, and lets a synchronous caller
//! run the same task under the same exclusion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Threads in the maintenance pool.
pub const WORKER_THREADS: usize = 2;

/// Pending tasks the pool will queue before refusing more.
const QUEUE_DEPTH: usize = 16;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Gate keeping one kind of background task single-instance.
#[derive(Debug, Default)]
pub struct SingleFlight {
    scheduled: AtomicBool,
    running: Mutex<()>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to schedule the task. Fails while an instance is
    /// already scheduled or running.
    pub fn try_schedule(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop a claim whose task was never submitted.
    pub fn cancel(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Run the scheduled instance and release the claim.
    pub fn run_scheduled<F: FnOnce()>(&self, task: F) {
        {
            let _running = self.running.lock();
            task();
        }
        self.scheduled.store(false, Ordering::Release);
    }

    /// Run the task now on the calling thread, after any running instance.
    pub fn run_now<F: FnOnce() -> R, R>(&self, task: F) -> R {
        let _running = self.running.lock();
        task()
    }
}

/// Fixed pool of named maintenance threads.
pub struct WorkerPool {
    sender: Sender<Message>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize, name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = bounded(QUEUE_DEPTH);
        let handles = (0..threads.max(1))
            .map(|i| {
                let receiver: Receiver<Message> = receiver.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || worker_loop(receiver))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!(threads = handles.len(), name, "started worker pool");
        Ok(Self {
            sender,
            handles: Mutex::new(handles),
        })
    }

    /// Queue a job. Returns false when the pool is saturated or stopped.
    pub fn submit(&self, job: Job) -> bool {
        match self.sender.try_send(Message::Run(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("worker pool queue full, dropping task");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Stop every worker after the jobs already queued and join them.
    ///
    /// Must not be called from a worker thread.
    pub fn shutdown(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for _ in &handles {
            if self.sender.send(Message::Shutdown).is_err() {
                break;
            }
        }
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "worker thread panicked");
            }
        }
    }
}

fn worker_loop(receiver: Receiver<Message>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(job) => job(),
            Message::Shutdown => break,
        }
    }
}
