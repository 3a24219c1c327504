//! Background loops with an explicit lifecycle.
//!
//! A [`Routine`] owns one main task plus the handler tasks it dispatches. Stopping
//! fires a shared stop signal, waits for the main task to observe it, then
//! either waits for the handlers or aborts them.

mod accept;
mod read;

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};

use crate::transport::{CloseSignal, Status};
use crate::utils::error::{Error, Result};

pub use accept::{AcceptRoutine, ConnectionHandler};
pub use read::{MessageHandler, ReadRoutine};

struct Running {
    stop: CloseSignal,
    main: JoinHandle<()>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

#[derive(Default)]
pub struct Routine {
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routine")
            .field("status", &self.status())
            .field("ongoing", &self.ongoing())
            .finish()
    }
}

impl Routine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `body` as the main task. It must return once the spawner's stop
    /// signal fires.
    pub fn start<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce(TaskSpawner) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let stop = CloseSignal::new();
        let tasks = Arc::new(Mutex::new(JoinSet::new()));
        let spawner = TaskSpawner {
            tasks: tasks.clone(),
            stop: stop.clone(),
        };
        let main = tokio::spawn(body(spawner));
        *running = Some(Running { stop, main, tasks });
        Ok(())
    }

    /// Stops the routine. With `abort_ongoing` dispatched handlers are
    /// aborted, otherwise they run to completion first.
    pub async fn stop(&self, abort_ongoing: bool) -> Result<()> {
        let running = self.running.lock().take().ok_or(Error::NotStarted)?;
        running.stop.fire();
        if let Err(e) = running.main.await {
            tracing::warn!("routine main task failed: {e}");
        }

        let mut tasks = std::mem::take(&mut *running.tasks.lock());
        if abort_ongoing {
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    pub fn status(&self) -> Status {
        match &*self.running.lock() {
            Some(running) if !running.main.is_finished() => Status::Started,
            _ => Status::Stopped,
        }
    }

    /// Number of dispatched handlers that have not been reaped yet.
    pub fn ongoing(&self) -> usize {
        match &*self.running.lock() {
            Some(running) => running.tasks.lock().len(),
            None => 0,
        }
    }
}

/// Handle given to a routine's main task for dispatching handler tasks.
#[derive(Clone)]
pub struct TaskSpawner {
    tasks: Arc<Mutex<JoinSet<()>>>,
    stop: CloseSignal,
}

impl TaskSpawner {
    /// Dispatches `task` unless the routine is stopping.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stop.is_fired() {
            return;
        }
        let mut tasks = self.tasks.lock();
        // reap finished handlers so the set does not grow without bound
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("handler task panicked: {e}");
                }
            }
        }
        tasks.spawn(task);
    }

    pub fn stop_signal(&self) -> CloseSignal {
        self.stop.clone()
    }
}
