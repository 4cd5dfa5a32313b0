//! Usage ledger — per-port, per-hour traffic counters.
//!
//! One row per `(hour, port)` under `UsageRecord:<hour>:<port>`. Hour 0 is
//! reserved for the all-time row that [`UsageLedger::compact`] folds old
//! hours into. Every increment is a read-merge-write executed on the store
//! worker, so concurrent events for the same row never lose counts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::port_registry::PortRegistry;
use crate::store::{decode_logged, KvStore, StoreError, Table};

pub const ROW_PATTERN: &str = "UsageRecord:%:%";

/// Hours in the trailing-week rollup window.
pub const WEEK_HOURS: u64 = 7 * 24;

/// Reserved bucket for the all-time row.
pub const ALL_TIME_HOUR: u64 = 0;

// ── UsageRecord ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub port: u16,
    /// Hours since the epoch; 0 = all-time.
    pub hour: u64,
    pub bytes_sent: u64,
    pub count_sent: u32,
    pub bytes_received: u64,
    pub count_received: u32,
}

impl UsageRecord {
    pub fn new(port: u16, hour: u64) -> Self {
        Self {
            port,
            hour,
            ..Self::default()
        }
    }

    /// A single send or receive of `len` bytes.
    pub fn event(is_outbound: bool, port: u16, hour: u64, len: usize) -> Self {
        let mut record = Self::new(port, hour);
        if is_outbound {
            record.bytes_sent = len as u64;
            record.count_sent = 1;
        } else {
            record.bytes_received = len as u64;
            record.count_received = 1;
        }
        record
    }

    pub fn key(&self) -> String {
        row_key(self.hour, self.port)
    }

    /// Field-wise add of another row for the same port and hour.
    pub fn append(&mut self, other: &UsageRecord) {
        debug_assert_eq!(self.port, other.port, "merging rows of different ports");
        debug_assert_eq!(self.hour, other.hour, "merging rows of different hours");
        self.add_counts(other);
    }

    fn add_counts(&mut self, other: &UsageRecord) {
        self.bytes_sent = self.bytes_sent.saturating_add(other.bytes_sent);
        self.count_sent = self.count_sent.saturating_add(other.count_sent);
        self.bytes_received = self.bytes_received.saturating_add(other.bytes_received);
        self.count_received = self.count_received.saturating_add(other.count_received);
    }

    pub fn is_empty(&self) -> bool {
        self.count_sent == 0 && self.count_received == 0
    }
}

pub fn row_key(hour: u64, port: u16) -> String {
    format!("UsageRecord:{hour}:{port}")
}

// ── Rollups ───────────────────────────────────────────────────────────────────

/// Three windows over one port's rows, plus the app it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortRollup {
    pub port: u16,
    pub app_name: Option<String>,
    pub current_hour: UsageRecord,
    pub trailing_week: UsageRecord,
    pub all_time: UsageRecord,
}

impl PortRollup {
    fn empty(port: u16, now_hour: u64) -> Self {
        Self {
            port,
            app_name: None,
            current_hour: UsageRecord::new(port, now_hour),
            trailing_week: UsageRecord::new(port, now_hour),
            all_time: UsageRecord::new(port, ALL_TIME_HOUR),
        }
    }

    fn absorb(&mut self, row: &UsageRecord, now_hour: u64) {
        self.all_time.add_counts(row);
        if row.hour == ALL_TIME_HOUR {
            return;
        }
        if row.hour >= now_hour.saturating_sub(WEEK_HOURS) {
            self.trailing_week.add_counts(row);
        }
        if row.hour == now_hour {
            self.current_hour.add_counts(row);
        }
    }
}

// ── Ledger ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct UsageLedger {
    store: KvStore,
    registry: PortRegistry,
}

impl UsageLedger {
    pub fn new(store: KvStore, registry: PortRegistry) -> Self {
        Self { store, registry }
    }

    /// Count one send or receive in the current hour. Returns immediately.
    pub fn record(&self, is_outbound: bool, port: u16, len: usize) {
        self.record_at(is_outbound, port, len, nbsp_core::now_hour());
    }

    pub fn record_at(&self, is_outbound: bool, port: u16, len: usize, hour: u64) {
        debug_assert!(port != 0, "port 0 is never routable");
        debug_assert!(hour != ALL_TIME_HOUR, "hour 0 is reserved");
        let event = UsageRecord::event(is_outbound, port, hour, len);
        let queued = self.store.submit("ledger-record", move |table| {
            merge_row(table, &event)?;
            Ok(())
        });
        if let Err(e) = queued {
            tracing::warn!(port, error = %e, "failed to queue ledger update");
        }
    }

    /// Rollups for every port with at least one row.
    pub async fn query(&self) -> Vec<PortRollup> {
        self.query_at(nbsp_core::now_hour()).await
    }

    pub async fn query_at(&self, now_hour: u64) -> Vec<PortRollup> {
        let mut rollups: BTreeMap<u16, PortRollup> = BTreeMap::new();
        for row in self.rows().await {
            rollups
                .entry(row.port)
                .or_insert_with(|| PortRollup::empty(row.port, now_hour))
                .absorb(&row, now_hour);
        }

        // Names only once every row is in.
        let mut out = Vec::with_capacity(rollups.len());
        for (port, mut rollup) in rollups {
            rollup.app_name = self.registry.name_for_port(port).await;
            out.push(rollup);
        }
        out
    }

    /// Rollup for one port; all zeros if it has never seen traffic.
    pub async fn query_port(&self, port: u16) -> PortRollup {
        self.query_port_at(port, nbsp_core::now_hour()).await
    }

    pub async fn query_port_at(&self, port: u16, now_hour: u64) -> PortRollup {
        let mut rollup = PortRollup::empty(port, now_hour);
        for row in self.rows().await.iter().filter(|r| r.port == port) {
            rollup.absorb(row, now_hour);
        }
        rollup.app_name = self.registry.name_for_port(port).await;
        rollup
    }

    /// Fold hourly rows older than `retention_hours` into each port's
    /// all-time row. Returns how many rows were folded; 0 retention is a
    /// no-op.
    pub async fn compact(&self, retention_hours: u64) -> Result<usize, StoreError> {
        self.compact_at(retention_hours, nbsp_core::now_hour()).await
    }

    pub async fn compact_at(&self, retention_hours: u64, now_hour: u64) -> Result<usize, StoreError> {
        if retention_hours == 0 {
            return Ok(0);
        }
        let cutoff = now_hour.saturating_sub(retention_hours);
        let folded = self
            .store
            .transact(move |table| {
                let mut totals: BTreeMap<u16, UsageRecord> = BTreeMap::new();
                let mut folded = 0;
                for (key, raw) in table.query(ROW_PATTERN)? {
                    let Some(row) = decode_logged::<UsageRecord>(&key, &raw) else {
                        continue;
                    };
                    if row.hour == ALL_TIME_HOUR || row.hour >= cutoff {
                        continue;
                    }
                    totals
                        .entry(row.port)
                        .or_insert_with(|| UsageRecord::new(row.port, ALL_TIME_HOUR))
                        .add_counts(&row);
                    table.delete(&key)?;
                    folded += 1;
                }
                for total in totals.values() {
                    merge_row(table, total)?;
                }
                Ok(folded)
            })
            .await?;
        tracing::info!(folded, cutoff, "ledger compacted");
        Ok(folded)
    }

    async fn rows(&self) -> Vec<UsageRecord> {
        match self.store.query(ROW_PATTERN).await {
            Ok(rows) => rows
                .iter()
                .filter_map(|(key, raw)| decode_logged(key, raw))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "ledger query failed");
                Vec::new()
            }
        }
    }
}

/// Read-merge-write of one row. Must run on the store worker.
fn merge_row(table: &Table<'_>, event: &UsageRecord) -> Result<UsageRecord, StoreError> {
    let key = event.key();
    let mut row = table
        .get_json::<UsageRecord>(&key)?
        .unwrap_or_else(|| UsageRecord::new(event.port, event.hour));
    row.append(event);
    table.put_json(&key, &row)?;
    Ok(row)
}
