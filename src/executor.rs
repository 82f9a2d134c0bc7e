use log::error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Runs the processor's worker task.
///
/// The processor submits exactly one long-lived task per instance; an
/// executor decides where that task runs.
pub trait Executor: Send + Sync {
    /// Run the given task.
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

/// Executor that spawns one named OS thread per task.
#[derive(Debug)]
pub struct ThreadExecutor {
    prefix: String,
    next_id: AtomicUsize,
}

impl ThreadExecutor {
    /// Create an executor naming its threads `{prefix}-{n}`.
    pub fn new(prefix: &str) -> ThreadExecutor {
        ThreadExecutor {
            prefix: prefix.to_owned(),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.prefix, id);
        let spawned = thread::Builder::new().name(name).spawn(move || task());
        if let Err(e) = spawned {
            error!("failed to spawn worker thread; err={}", e);
        }
    }
}
