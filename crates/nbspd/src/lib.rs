//! nbspd — the proxy side of NBSProxy.
//!
//! [`Relay`] owns the routing table and usage ledger, fans inbound SMS out
//! to registered apps and carries client requests to the transport.

pub mod delivery;
pub mod notify;
pub mod relay;
pub mod requests;

#[cfg(test)]
mod testkit;

pub use delivery::{DeliveryTracker, PortDeliveries};
pub use notify::LogNotifier;
pub use relay::{ProxyHost, Relay, LAST_RECEIVE_KEY};
pub use requests::{SendError, SendReport};
