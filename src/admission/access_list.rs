use std::collections::HashSet;

use parking_lot::RwLock;

use crate::admission::AdmissionHandler;
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessListKind {
    /// Rejects listed sources.
    Blacklist,
    /// Rejects unlisted sources, unless the list is empty.
    Whitelist,
}

/// A mutable set of source addresses checked on admission.
#[derive(Debug)]
pub struct AccessList {
    kind: AccessListKind,
    entries: RwLock<HashSet<String>>,
}

impl AccessList {
    pub fn blacklist(entries: impl IntoIterator<Item = String>) -> Self {
        Self::new(AccessListKind::Blacklist, entries)
    }

    pub fn whitelist(entries: impl IntoIterator<Item = String>) -> Self {
        Self::new(AccessListKind::Whitelist, entries)
    }

    fn new(kind: AccessListKind, entries: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind,
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn kind(&self) -> AccessListKind {
        self.kind
    }

    pub fn add(&self, source: impl Into<String>) -> bool {
        self.entries.write().insert(source.into())
    }

    pub fn remove(&self, source: &str) -> bool {
        self.entries.write().remove(source)
    }

    pub fn contains(&self, source: &str) -> bool {
        self.entries.read().contains(source)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl AdmissionHandler for AccessList {
    fn admit(&self, source: &str) -> Result<()> {
        let entries = self.entries.read();
        match self.kind {
            AccessListKind::Blacklist if entries.contains(source) => Err(
                Error::AdmissionRejected(format!("{source} is blacklisted")),
            ),
            AccessListKind::Whitelist if !entries.is_empty() && !entries.contains(source) => Err(
                Error::AdmissionRejected(format!("{source} is not whitelisted")),
            ),
            _ => Ok(()),
        }
    }
}
