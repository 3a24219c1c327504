//! The `admission` module decides whether an inbound peer may connect at all.
//!
//! Listeners run an [`AdmissionChain`] on the peer address before any
//! [`Connection`](crate::transport::Connection) is built. Handlers run in
//! order and the first rejection wins.

mod access_list;
mod rate_limit;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::AdmissionSettings;
use crate::utils::error::Result;

pub use access_list::{AccessList, AccessListKind};
pub use rate_limit::IpRateLimiter;

/// One pre-acceptance check.
pub trait AdmissionHandler: Send + Sync {
    /// `source` is the peer IP when the address parses as a socket address,
    /// otherwise the raw address.
    fn admit(&self, source: &str) -> Result<()>;
}

/// Reduces a peer address to the key admission handlers compare against.
pub fn source_key(address: &str) -> String {
    match address.parse::<SocketAddr>() {
        Ok(addr) => addr.ip().to_string(),
        Err(_) => address.to_string(),
    }
}

/// Ordered list of admission handlers.
#[derive(Clone, Default)]
pub struct AdmissionChain {
    handlers: Vec<Arc<dyn AdmissionHandler>>,
}

impl std::fmt::Debug for AdmissionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionChain")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl AdmissionChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn AdmissionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn push(&mut self, handler: Arc<dyn AdmissionHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs every handler against `address` in order.
    pub fn admit(&self, address: &str) -> Result<()> {
        let source = source_key(address);
        self.handlers
            .iter()
            .try_for_each(|handler| handler.admit(&source))
    }

    /// Builds the chain rate limiter, blacklist, whitelist.
    ///
    /// Stages that are disabled in `settings` are left out. The rate limiter is
    /// returned separately so the caller can run its pruning task.
    pub fn from_settings(settings: &AdmissionSettings) -> (Self, Option<Arc<IpRateLimiter>>) {
        let mut chain = Self::new();
        let limiter = (settings.rate_limit_capacity > 0).then(|| {
            Arc::new(IpRateLimiter::new(
                settings.rate_limit_capacity,
                settings.rate_limit_refill_per_sec,
            ))
        });
        if let Some(limiter) = &limiter {
            chain.push(limiter.clone());
        }
        if !settings.blacklist.is_empty() {
            chain.push(Arc::new(AccessList::blacklist(settings.blacklist.clone())));
        }
        if !settings.whitelist.is_empty() {
            chain.push(Arc::new(AccessList::whitelist(settings.whitelist.clone())));
        }
        (chain, limiter)
    }
}
