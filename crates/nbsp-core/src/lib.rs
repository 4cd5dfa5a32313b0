//! nbsp-core — shared types, wire format, configuration and the capability
//! seams through which the NBSProxy core talks to its host platform.
//! All other NBSProxy crates depend on this one.

pub mod capability;
pub mod config;
pub mod wire;

pub use wire::{Command, Frame, ProtocolVersion, VersionCheck};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whole hours since the Unix epoch. Usage ledger rows are bucketed by this.
pub fn now_hour() -> u64 {
    now_ms() / (1000 * 60 * 60)
}
