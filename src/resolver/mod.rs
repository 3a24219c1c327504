//! The `resolver` module maps topics to the broker endpoint serving them.
//!
//! Async and sync topics live in separate namespaces. A lookup is a strictly
//! one-shot exchange: the server reads one request, writes one response and
//! closes the connection, whatever the outcome.

pub mod client;
pub mod registry;
pub mod server;

pub use client::{resolve, resolve_over};
pub use registry::{Resolver, TopicClass};
pub use server::ResolverServer;
