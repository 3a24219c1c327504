//! Close notification and adjustable deadlines shared by every transport.
//!
//! Channels and upgraded sockets have no native deadlines, so every blocking
//! operation is raced against a [`CloseSignal`] and a [`Deadline`] instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::utils::error::{Error, Result};

/// A one-shot broadcast flag: fired once, observed by any number of waiters.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal. Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired.
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this only returns once fired
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// An operation deadline that can be moved while an operation is waiting on it.
#[derive(Debug)]
pub struct Deadline {
    tx: watch::Sender<Option<Instant>>,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

impl Deadline {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Sets the deadline `timeout` from now; `None` removes it.
    pub fn set(&self, timeout: Option<Duration>) {
        self.tx.send_replace(timeout.map(|t| Instant::now() + t));
    }

    pub fn get(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    /// Drives `op` until it completes, the deadline passes or `close` fires.
    ///
    /// The deadline is re-read whenever it changes, so [`Deadline::set`] from
    /// another task shortens or extends an operation already in progress.
    pub async fn run<T, F>(&self, close: &CloseSignal, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut rx = self.tx.subscribe();
        tokio::pin!(op);
        loop {
            let deadline = *rx.borrow_and_update();
            let expired = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                result = &mut op => return result,
                _ = close.fired() => return Err(Error::ConnectionClosed),
                _ = expired => return Err(Error::Timeout),
                _ = rx.changed() => continue,
            }
        }
    }
}

/// Races `op` against a stop signal and an optional timeout.
pub async fn race<T, F>(stop: &CloseSignal, timeout: Option<Duration>, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let expired = async move {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        result = op => result,
        _ = stop.fired() => Err(Error::ConnectionClosed),
        _ = expired => Err(Error::Timeout),
    }
}
