//! The `broker` module routes messages between subscribed connections.
//!
//! - `subscriptions`: the topic ↔ connection index
//! - `engine`: [`Broker`], asynchronous fan-out and synchronous scatter-gather
//! - `server`: [`BrokerServer`], the wire protocol on top of a listener

pub mod engine;
pub mod server;
pub mod subscriptions;
pub mod topic;

pub use engine::Broker;
pub use server::BrokerServer;
pub use subscriptions::Subscriptions;

#[cfg(test)]
mod tests;
