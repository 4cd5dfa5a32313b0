//! nbsp-client — the library a client app links to talk to the proxy app.
//!
//! A [`ProxyClient`] registers the app for an NBS port, hands outbound
//! payloads to the proxy and dispatches frames the proxy relays back.

pub mod client;
pub mod handshake;
pub mod pending;

pub use client::{ClientError, ClientHost, ProxyCallbacks, ProxyClient, LAST_CONTACT_KEY};
pub use handshake::{RegisterOutcome, RegistrationState};
pub use pending::PendingSends;
