pub mod port_registry;
pub mod store;
pub mod usage_ledger;

pub use port_registry::PortRegistry;
pub use store::{KvStore, StoreError, Table};
pub use usage_ledger::{PortRollup, UsageLedger, UsageRecord};
