use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error};

use crate::error::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single worker thread that runs notifications in submission order.
///
/// Listener callbacks run here so that they never execute on a transport
/// reader thread or while a session lock is held.
pub struct Dispatcher {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl Dispatcher {
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in rx {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("listener notification panicked");
                    }
                }
                debug!("dispatcher drained");
            })
            .map_err(chanlink_transport::TransportError::Io)?;
        let worker_id = worker.thread().id();

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Queue `job`. Returns `false` once the dispatcher is shut down.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs and wait for queued ones to run.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if thread::current().id() == self.worker_id {
            return;
        }
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
