use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::routine::{Routine, TaskSpawner};
use crate::transport::{SharedConnection, Status};
use crate::utils::error::{Error, Result};

/// Consumes frames read from a connection.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, data: Vec<u8>, connection: SharedConnection);
}

/// Reads frames from one connection until it closes or the routine stops.
///
/// Timeouts and protocol errors are skipped; terminal errors end the loop.
pub struct ReadRoutine {
    connection: SharedConnection,
    handler: Arc<dyn MessageHandler>,
    read_timeout: Option<Duration>,
    concurrent: bool,
    routine: Routine,
}

impl ReadRoutine {
    pub fn new(
        connection: SharedConnection,
        handler: Arc<dyn MessageHandler>,
        read_timeout: Option<Duration>,
        concurrent: bool,
    ) -> Self {
        Self {
            connection,
            handler,
            read_timeout,
            concurrent,
            routine: Routine::new(),
        }
    }

    pub fn start(&self) -> Result<()> {
        let connection = self.connection.clone();
        let handler = self.handler.clone();
        let read_timeout = self.read_timeout;
        let concurrent = self.concurrent;
        self.routine.start(move |spawner| {
            read_loop(connection, handler, read_timeout, concurrent, spawner)
        })
    }

    pub async fn stop(&self, abort_ongoing: bool) -> Result<()> {
        self.routine.stop(abort_ongoing).await
    }

    pub fn status(&self) -> Status {
        self.routine.status()
    }
}

async fn read_loop(
    connection: SharedConnection,
    handler: Arc<dyn MessageHandler>,
    read_timeout: Option<Duration>,
    concurrent: bool,
    spawner: TaskSpawner,
) {
    let stop = spawner.stop_signal();
    loop {
        let result = tokio::select! {
            _ = stop.fired() => break,
            result = connection.read(read_timeout) => result,
        };
        match result {
            Ok(data) => {
                let handler = handler.clone();
                let connection = connection.clone();
                let task = async move { handler.handle(data, connection).await };
                if concurrent {
                    spawner.spawn(task);
                } else {
                    task.await;
                }
            }
            Err(Error::Timeout) => continue,
            Err(e) if e.is_terminal() => {
                debug!(connection = %connection.instance_id(), "read loop ended: {e}");
                break;
            }
            Err(e) => {
                debug!(connection = %connection.instance_id(), "skipping unreadable frame: {e}");
            }
        }
    }
}
