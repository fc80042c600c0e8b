//! Task lanes. The engine runs on three of them: a serial writer
//! domain for every queue/local-store mutation, a serial sync lane
//! shared by push and pull, and a bounded pool that user completions
//! are dispatched on.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::debug;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executor user completions run on. The engine never invokes a
/// completion on the writer domain or the sync lane.
pub trait CallbackExecutor: Send + Sync {
    fn submit(&self, job: Job);
}

/// One dedicated worker thread draining a FIFO of jobs. Dropping the
/// lane closes the channel; queued jobs still run before the thread
/// exits.
pub struct SerialLane {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl SerialLane {
    pub fn spawn(name: &str) -> std::io::Result<SerialLane> {
        let (tx, rx) = mpsc::channel::<Job>();
        let lane_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
            }
            debug!(lane = %lane_name, "lane drained and stopped");
        })?;
        Ok(SerialLane { tx: Some(tx), handle: Some(handle) })
    }

    /// Enqueue fire-and-forget work. Silently dropped once the lane is
    /// shutting down; callers that need the result use [`run_sync`].
    ///
    /// [`run_sync`]: SerialLane::run_sync
    pub fn submit(&self, job: Job) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }

    /// Run `f` on the lane and wait for its result. Returns `None`
    /// when the lane is gone. Must not be called from the lane's own
    /// thread.
    pub fn run_sync<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        self.submit(Box::new(move || {
            let _ = done_tx.send(f());
        }));
        done_rx.recv().ok()
    }
}

impl Drop for SerialLane {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            // A job can drop the last reference to the structure that
            // owns this lane, landing this drop on the lane's own
            // thread; joining it from there would never return.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Fixed-size worker pool, the bundled callback executor
/// (default 4 workers).
pub struct BoundedExecutor {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl BoundedExecutor {
    pub const DEFAULT_WORKERS: usize = 4;

    pub fn new(workers: usize) -> std::io::Result<BoundedExecutor> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::new();
        for n in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("offsync-cb-{n}"))
                .spawn(move || {
                    loop {
                        let job = {
                            let Ok(guard) = rx.lock() else { return };
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => return,
                        }
                    }
                })?;
            handles.push(handle);
        }
        Ok(BoundedExecutor { tx: Some(tx), workers: handles })
    }
}

impl CallbackExecutor for BoundedExecutor {
    fn submit(&self, job: Job) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        self.tx.take();
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}
