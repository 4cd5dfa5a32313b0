//! nbspd — inspect and maintain the proxy's routing table and usage ledger.

use std::sync::Arc;

use anyhow::{Context, Result};

use nbsp_core::capability::InstalledApps;
use nbsp_core::config::NbspConfig;
use nbsp_services::{KvStore, PortRegistry, UsageLedger};

/// Outside the handset there is no package manager to ask.
struct NoPackageManager;

impl InstalledApps for NoPackageManager {
    fn is_installed(&self, _app_id: &str) -> bool {
        false
    }
    fn install_timestamp(&self, _app_id: &str) -> Option<u64> {
        None
    }
    fn display_name_for(&self, _app_id: &str) -> Option<String> {
        None
    }
}

struct Services {
    registry: PortRegistry,
    ledger: UsageLedger,
}

fn open(config: &NbspConfig) -> Result<Services> {
    let store = KvStore::open(&config.store.path, config.store.idle_timeout())
        .with_context(|| format!("failed to open store at {}", config.store.path.display()))?;
    let registry = PortRegistry::new(store.clone(), Arc::new(NoPackageManager));
    let ledger = UsageLedger::new(store, registry.clone());
    Ok(Services { registry, ledger })
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_ports(config: &NbspConfig) -> Result<()> {
    let services = open(config)?;
    let table = services.registry.snapshot().await;
    if table.is_empty() {
        println!("No ports registered.");
        return Ok(());
    }
    println!("{:<8} APPS", "PORT");
    for (port, apps) in table {
        println!("{:<8} {}", port, apps.join(", "));
    }
    Ok(())
}

async fn cmd_stats(config: &NbspConfig) -> Result<()> {
    let services = open(config)?;
    let rollups = services.ledger.query().await;
    if rollups.is_empty() {
        println!("No traffic recorded.");
        return Ok(());
    }
    println!(
        "{:<8} {:<28} {:>14} {:>14} {:>14}",
        "PORT", "APPS", "HOUR sent/rcv", "WEEK sent/rcv", "ALL sent/rcv"
    );
    for r in rollups {
        let apps = services.registry.lookup(r.port).await.join(",");
        let label = r.app_name.unwrap_or(apps);
        println!(
            "{:<8} {:<28} {:>14} {:>14} {:>14}",
            r.port,
            label,
            format!("{}/{}", r.current_hour.count_sent, r.current_hour.count_received),
            format!("{}/{}", r.trailing_week.count_sent, r.trailing_week.count_received),
            format!("{}/{}", r.all_time.count_sent, r.all_time.count_received),
        );
        println!(
            "{:<8} {:<28} {:>14} {:>14} {:>14}",
            "",
            "  bytes",
            format!("{}/{}", r.current_hour.bytes_sent, r.current_hour.bytes_received),
            format!("{}/{}", r.trailing_week.bytes_sent, r.trailing_week.bytes_received),
            format!("{}/{}", r.all_time.bytes_sent, r.all_time.bytes_received),
        );
    }
    Ok(())
}

async fn cmd_compact(config: &NbspConfig, hours: Option<u64>) -> Result<()> {
    let retention = hours.unwrap_or(config.ledger.retention_hours);
    if retention == 0 {
        println!("Retention is 0 (keep forever); nothing to do.");
        return Ok(());
    }
    let services = open(config)?;
    let folded = services
        .ledger
        .compact(retention)
        .await
        .context("ledger compaction failed")?;
    println!("Folded {folded} hourly rows older than {retention}h into all-time totals.");
    Ok(())
}

fn cmd_config(config: &NbspConfig) -> Result<()> {
    let path = NbspConfig::write_default_if_missing().context("failed to write default config")?;
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config).context("failed to render config")?);
    Ok(())
}

fn print_usage() {
    println!("nbspd — NBSProxy maintenance");
    println!();
    println!("Usage: nbspd <command>");
    println!();
    println!("Commands:");
    println!("  ports              List the port routing table");
    println!("  stats              Show per-port traffic rollups");
    println!("  compact [hours]    Fold old ledger hours into all-time totals");
    println!("  config             Show the effective configuration");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = NbspConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        NbspConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["ports"] | [] => cmd_ports(&config).await,
        ["stats"] => cmd_stats(&config).await,
        ["compact"] => cmd_compact(&config, None).await,
        ["compact", hours] => {
            let hours = hours.parse().context("compact hours must be a number")?;
            cmd_compact(&config, Some(hours)).await
        }
        ["config"] => cmd_config(&config),
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
