use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::AccepterSettings;
use crate::routine::{Routine, TaskSpawner};
use crate::transport::{CloseSignal, SharedConnection, SharedListener, Status};
use crate::utils::error::{Error, Result};

/// Serves one accepted connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Runs until the connection is done or `stop` fires. An error closes the connection.
    async fn handle(&self, connection: SharedConnection, stop: CloseSignal) -> Result<()>;
}

/// Accepts connections in a loop and dispatches each to a [`ConnectionHandler`].
pub struct AcceptRoutine {
    listener: SharedListener,
    handler: Arc<dyn ConnectionHandler>,
    settings: AccepterSettings,
    routine: Routine,
}

impl AcceptRoutine {
    pub fn new(
        listener: SharedListener,
        handler: Arc<dyn ConnectionHandler>,
        settings: AccepterSettings,
    ) -> Self {
        Self {
            listener,
            handler,
            settings,
            routine: Routine::new(),
        }
    }

    pub fn start(&self) -> Result<()> {
        let listener = self.listener.clone();
        let handler = self.handler.clone();
        let settings = self.settings.clone();
        self.routine
            .start(move |spawner| accept_loop(listener, handler, settings, spawner))?;
        info!(address = %self.listener.address(), "accept routine started");
        Ok(())
    }

    /// Stops accepting. The listener itself stays open.
    pub async fn stop(&self) -> Result<()> {
        self.routine
            .stop(self.settings.abort_ongoing_on_stop)
            .await?;
        info!(address = %self.listener.address(), "accept routine stopped");
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.routine.status()
    }

    pub fn ongoing(&self) -> usize {
        self.routine.ongoing()
    }

    pub fn listener(&self) -> &SharedListener {
        &self.listener
    }
}

async fn accept_loop(
    listener: SharedListener,
    handler: Arc<dyn ConnectionHandler>,
    settings: AccepterSettings,
    spawner: TaskSpawner,
) {
    let stop = spawner.stop_signal();
    loop {
        let accepted = tokio::select! {
            _ = stop.fired() => break,
            result = listener.accept(settings.accept_timeout()) => result,
        };
        let connection = match accepted {
            Ok(connection) => connection,
            Err(Error::ConnectionClosed) => {
                debug!("listener closed, accept loop exiting");
                break;
            }
            Err(Error::Timeout) => continue,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        debug!(connection = %connection.instance_id(), address = %connection.address(), "accepted connection");
        let task = serve(
            handler.clone(),
            connection,
            stop.clone(),
            settings.connection_lifetime(),
        );
        if settings.handle_concurrently {
            spawner.spawn(task);
        } else {
            task.await;
        }
    }
}

async fn serve(
    handler: Arc<dyn ConnectionHandler>,
    connection: SharedConnection,
    stop: CloseSignal,
    lifetime: Option<Duration>,
) {
    let lifetime_timer = lifetime.map(|lifetime| {
        let connection = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            if connection.close().await.is_ok() {
                debug!(connection = %connection.instance_id(), "connection lifetime expired");
            }
        })
    });

    if let Err(e) = handler.handle(connection.clone(), stop).await {
        debug!(connection = %connection.instance_id(), "connection handler failed: {e}");
        let _ = connection.close().await;
    }

    if let Some(timer) = lifetime_timer {
        timer.abort();
    }
}
