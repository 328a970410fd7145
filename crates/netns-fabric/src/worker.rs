//! Bounded worker pool for concurrent link setup
//!
//! Namespace context is per-thread, so workers are long-lived dedicated
//! OS threads, each owning a current-thread tokio runtime. A task's first
//! action is switching its worker into the backbone namespace it was
//! handed; the thread stays there until the next task moves it.
//!
//! The first task error is kept and surfaced by `wait()`; workers keep
//! draining the queue after an error so the driver's join never hangs.

use crate::FabricError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::warn;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("a worker task failed")]
    Failed,
}

/// A unit of link-setup work. The runtime reference is the worker's own
/// current-thread runtime, used to drive async netlink calls.
pub type Task = Box<dyn FnOnce(&Runtime) -> Result<(), FabricError> + Send + 'static>;

struct PoolState {
    pending: Mutex<usize>,
    drained: Condvar,
    has_error: AtomicBool,
    first_error: Mutex<Option<FabricError>>,
}

impl PoolState {
    fn finish_task(&self, result: Result<(), FabricError>) {
        if let Err(e) = result {
            if self.has_error.swap(true, Ordering::SeqCst) {
                warn!("worker task failed after first error: {}", e);
            } else {
                *self.first_error.lock() = Some(e);
            }
        }
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

pub struct WorkerPool {
    tx: Option<SyncSender<Task>>,
    workers: Vec<JoinHandle<()>>,
    state: Arc<PoolState>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a FIFO queue of capacity `2 * size`.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Task>(size.max(1) * 2);
        let rx = Arc::new(Mutex::new(rx));
        let state = Arc::new(PoolState {
            pending: Mutex::new(0),
            drained: Condvar::new(),
            has_error: AtomicBool::new(false),
            first_error: Mutex::new(None),
        });

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let rx = rx.clone();
            let state = state.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("link-worker-{}", id))
                    .spawn(move || worker_loop(runtime, rx, state))?,
            );
        }

        Ok(Self {
            tx: Some(tx),
            workers,
            state,
        })
    }

    /// Queue a task; blocks only while the queue is at capacity.
    pub fn submit(
        &self,
        task: impl FnOnce(&Runtime) -> Result<(), FabricError> + Send + 'static,
    ) -> Result<(), WorkerError> {
        let tx = self.tx.as_ref().ok_or(WorkerError::PoolClosed)?;
        *self.state.pending.lock() += 1;
        if tx.send(Box::new(task)).is_err() {
            *self.state.pending.lock() -= 1;
            return Err(WorkerError::PoolClosed);
        }
        Ok(())
    }

    /// Block until the queue drains and all in-flight tasks complete,
    /// then surface the first collected error, if any.
    pub fn wait(&self) -> Result<(), FabricError> {
        let mut pending = self.state.pending.lock();
        while *pending > 0 {
            self.state.drained.wait(&mut pending);
        }
        drop(pending);

        if self.state.has_error.load(Ordering::SeqCst) {
            let err = self
                .state
                .first_error
                .lock()
                .take()
                .unwrap_or_else(|| FabricError::Worker(WorkerError::Failed));
            return Err(err);
        }
        Ok(())
    }

    /// True once any task has failed; sticky for the pool's lifetime.
    pub fn has_error(&self) -> bool {
        self.state.has_error.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops once drained.
        self.tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(runtime: Runtime, rx: Arc<Mutex<Receiver<Task>>>, state: Arc<PoolState>) {
    loop {
        // Hold the receiver lock only for the dequeue itself.
        let task = {
            let rx = rx.lock();
            rx.recv()
        };
        match task {
            Ok(task) => {
                let result = task(&runtime);
                state.finish_task(result);
            }
            Err(_) => break,
        }
    }
}
