//! The `client` module is the application side of the broker protocol.
//!
//! A [`BrokerLink`] is one connection to one broker: it sends messages,
//! matches responses to the requests awaiting them and forwards everything
//! else. The [`SubscriptionManager`] resolves topics through the resolver and
//! reuses one link per broker.

pub mod link;
pub mod manager;

pub use link::BrokerLink;
pub use manager::SubscriptionManager;
