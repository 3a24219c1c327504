//! # Switchyard
//!
//! `switchyard` is a messaging substrate: one message-oriented connection
//! abstraction over TCP, websocket and in-process transports, a topic-based
//! publish/subscribe broker routing asynchronous and scatter-gather
//! synchronous messages, and a resolver mapping topics to the broker serving
//! them.
//!
//! ## Core Modules
//!
//! - `transport`: connections and listeners for every transport, plus dialing.
//! - `admission`: rate limiting, blacklist and whitelist checks run before accept.
//! - `routine`: background accept and read loops with a start/stop lifecycle.
//! - `correlator`: matches responses to outstanding requests by token.
//! - `broker`: subscriptions, async and sync routing, and the broker wire service.
//! - `resolver`: the topic → endpoint registry and its one-shot lookup service.
//! - `client`: broker links and the client-side subscription manager.
//! - `message`: the envelope carried in every frame.
//! - `config`: layered configuration loading.
//! - `utils`: errors, logging, metrics and command handlers.

pub mod admission;
pub mod broker;
pub mod client;
pub mod config;
pub mod correlator;
pub mod message;
pub mod resolver;
pub mod routine;
pub mod transport;
pub mod utils;

pub use utils::{Error, Result};

#[cfg(test)]
mod tests;
