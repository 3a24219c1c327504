//! The `correlator` module matches asynchronous replies to outstanding requests.
//!
//! Each in-flight request is keyed by its sync token and owns a channel, the
//! number of responses it still accepts and an optional timeout. Once the last
//! expected response arrives, the deadline passes or the request is aborted,
//! the entry retires and the channel closes.
//!
//! A request handle therefore yields `0..=limit` responses. Comparing
//! [`PendingRequest::received`] with [`PendingRequest::limit`] tells a complete
//! exchange from one cut short by its timeout.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::utils::error::{Error, Result};

/// Bounds applied to every new request.
#[derive(Debug, Clone, Copy)]
pub struct CorrelatorSettings {
    pub min_token_length: usize,
    /// `0` means unbounded.
    pub max_token_length: usize,
    /// `0` means unbounded.
    pub max_active_requests: usize,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            min_token_length: 1,
            max_token_length: 0,
            max_active_requests: 0,
        }
    }
}

struct Entry<T> {
    /// Distinguishes reuses of the same token so a stale timer never retires
    /// a newer request.
    id: u64,
    sender: mpsc::UnboundedSender<T>,
    remaining: usize,
    owners: Vec<String>,
    timer: Option<JoinHandle<()>>,
}

impl<T> Entry<T> {
    fn retire(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

type Entries<T> = Arc<Mutex<HashMap<String, Entry<T>>>>;

pub struct Correlator<T> {
    settings: CorrelatorSettings,
    entries: Entries<T>,
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for Correlator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("settings", &self.settings)
            .field("active", &self.entries.lock().len())
            .finish()
    }
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self::new(CorrelatorSettings::default())
    }
}

impl<T> Correlator<T> {
    pub fn new(settings: CorrelatorSettings) -> Self {
        Self {
            settings,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &CorrelatorSettings {
        &self.settings
    }

    /// Delivers one response to `token`. Retires the entry when its limit is reached.
    pub fn add_response(&self, token: &str, response: T) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(token)
            .ok_or_else(|| Error::InvalidToken(token.to_string()))?;

        // the caller may have stopped listening; the response still counts
        let _ = entry.sender.send(response);
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining == 0 {
            if let Some(entry) = entries.remove(token) {
                entry.retire();
            }
        }
        Ok(())
    }

    /// Retires `token` immediately, closing its channel.
    pub fn abort(&self, token: &str) -> Result<()> {
        let entry = self
            .entries
            .lock()
            .remove(token)
            .ok_or_else(|| Error::InvalidToken(token.to_string()))?;
        entry.retire();
        Ok(())
    }

    /// Retires every request `owner` takes part in. Returns how many were retired.
    pub fn abort_owned_by(&self, owner: &str) -> usize {
        let mut entries = self.entries.lock();
        let tokens: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.owners.iter().any(|o| o == owner))
            .map(|(token, _)| token.clone())
            .collect();
        for token in &tokens {
            if let Some(entry) = entries.remove(token) {
                entry.retire();
            }
        }
        tokens.len()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries.lock().contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn active_tokens(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    fn check_token(&self, token: &str) -> Result<()> {
        let len = token.len();
        if len < self.settings.min_token_length
            || (self.settings.max_token_length > 0 && len > self.settings.max_token_length)
        {
            return Err(Error::InvalidToken(token.to_string()));
        }
        Ok(())
    }
}

impl<T: Send + 'static> Correlator<T> {
    /// Registers a request accepting up to `limit` responses.
    pub fn new_request(
        &self,
        token: impl Into<String>,
        limit: usize,
        timeout: Option<Duration>,
    ) -> Result<PendingRequest<T>> {
        self.new_owned_request(token, limit, timeout, Vec::new())
    }

    /// Like [`Correlator::new_request`], tagging the entry with the parties
    /// involved so [`Correlator::abort_owned_by`] can find it.
    pub fn new_owned_request(
        &self,
        token: impl Into<String>,
        limit: usize,
        timeout: Option<Duration>,
        owners: Vec<String>,
    ) -> Result<PendingRequest<T>> {
        let token = token.into();
        self.check_token(&token)?;
        if limit == 0 {
            return Err(Error::protocol("response limit must be at least 1"));
        }

        let mut entries = self.entries.lock();
        if entries.contains_key(&token) {
            return Err(Error::TokenCollision(token));
        }
        if self.settings.max_active_requests > 0
            && entries.len() >= self.settings.max_active_requests
        {
            return Err(Error::TooManyRequests);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let timer = timeout.map(|timeout| spawn_timer(self.entries.clone(), token.clone(), id, timeout));
        entries.insert(
            token.clone(),
            Entry {
                id,
                sender,
                remaining: limit,
                owners,
                timer,
            },
        );

        Ok(PendingRequest {
            token,
            id,
            limit,
            received: 0,
            receiver,
            entries: Arc::downgrade(&self.entries),
        })
    }
}

fn spawn_timer<T: Send + 'static>(
    entries: Entries<T>,
    token: String,
    id: u64,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let mut entries = entries.lock();
        if entries.get(&token).is_some_and(|entry| entry.id == id) {
            entries.remove(&token);
            debug!(token = %token, "request timed out");
        }
    })
}

/// Caller side of one registered request.
///
/// Dropping the handle retires its entry if it is still active.
pub struct PendingRequest<T> {
    token: String,
    id: u64,
    limit: usize,
    received: usize,
    receiver: mpsc::UnboundedReceiver<T>,
    entries: Weak<Mutex<HashMap<String, Entry<T>>>>,
}

impl<T> std::fmt::Debug for PendingRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("token", &self.token)
            .field("limit", &self.limit)
            .field("received", &self.received)
            .finish()
    }
}

impl<T> Drop for PendingRequest<T> {
    fn drop(&mut self) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = entries.lock();
        if entries.get(&self.token).is_some_and(|entry| entry.id == self.id) {
            if let Some(entry) = entries.remove(&self.token) {
                entry.retire();
                debug!(token = %self.token, "request dropped by its caller");
            }
        }
    }
}

impl<T> PendingRequest<T> {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.limit
    }

    /// Next response, or `None` once the request has retired and every
    /// delivered response has been taken.
    pub async fn next(&mut self) -> Option<T> {
        let response = self.receiver.recv().await;
        if response.is_some() {
            self.received += 1;
        }
        response
    }

    /// Waits for the request to retire and returns every response it got.
    pub async fn collect(mut self) -> Vec<T> {
        let mut responses = Vec::new();
        while let Some(response) = self.next().await {
            responses.push(response);
        }
        responses
    }
}

#[cfg(test)]
mod tests;
