//! # Event Log Seeder
//!
//! Populates a development event log with inventory history so resync can
//! be exercised against something realistic.
//!
//! ## Usage
//! ```bash
//! # 3 stores, 20 deltas each (default)
//! cargo run -p tally-db --bin seed
//!
//! # Custom amounts
//! cargo run -p tally-db --bin seed -- --stores 10 --events 200
//!
//! # Specify database path
//! cargo run -p tally-db --bin seed -- --db ./data/sync.db
//! ```
//!
//! ## Generated History
//! For each store `store-NNN`:
//! - version 1: `state.replace` with a full stock snapshot
//! - versions 2..: `stock.delta` events moving one SKU by a small amount
//!
//! Events alternate between two fake origins, as if two registers were
//! selling side by side.

use std::collections::BTreeMap;
use std::env;

use serde_json::json;
use tally_core::{EntityKey, Origin, ScopeTags, SyncEvent, EVENT_STATE_REPLACE};
use tally_db::{Database, DbConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const CHANNEL: &str = "inventory";

const SKUS: &[&str] = &[
    "COKE-330", "PEPSI-330", "WATER-500", "CHIPS-150", "CANDY-50", "MILK-1L", "BREAD-WHT",
    "EGGS-12", "COFFEE-250", "TEA-100",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    let mut stores: usize = 3;
    let mut events_per_store: usize = 20;
    let mut db_path = String::from("./tally_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--stores" | "-s" => {
                if i + 1 < args.len() {
                    stores = args[i + 1].parse().unwrap_or(stores);
                    i += 1;
                }
            }
            "--events" | "-e" => {
                if i + 1 < args.len() {
                    events_per_store = args[i + 1].parse().unwrap_or(events_per_store);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally Event Log Seeder");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -s, --stores <N>   Number of inventory entities (default: 3)");
                println!("  -e, --events <N>   Delta events per entity (default: 20)");
                println!("  -d, --db <PATH>    Database file path (default: ./tally_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!(db = %db_path, stores, events_per_store, "Seeding event log");

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let repo = db.sync_events();

    let device = Uuid::new_v4().to_string();
    let registers = [
        Origin::new(device.clone(), Uuid::new_v4().to_string()),
        Origin::new(device, Uuid::new_v4().to_string()),
    ];

    let start = std::time::Instant::now();
    let mut written = 0usize;

    for store_idx in 0..stores {
        let key = EntityKey::new(CHANNEL, format!("store-{:03}", store_idx + 1));

        let existing = repo.latest_version(&key.channel, &key.entity_id).await?;
        if existing > 0 {
            warn!(entity = %key, version = existing, "Entity already has history, skipping");
            continue;
        }

        let scope = ScopeTags::branch(format!("branch-{}", store_idx % 2 + 1));

        let levels: BTreeMap<&str, i64> = SKUS
            .iter()
            .enumerate()
            .map(|(n, sku)| (*sku, 20 + ((store_idx * 7 + n * 13) % 80) as i64))
            .collect();

        let snapshot = SyncEvent::new(
            &key,
            EVENT_STATE_REPLACE,
            json!({ "levels": levels }),
            1,
            registers[0].token(),
        )
        .with_scope(scope.clone());
        repo.insert(&snapshot).await?;
        written += 1;

        for n in 0..events_per_store {
            let seed = store_idx * 1000 + n;
            let sku = SKUS[seed % SKUS.len()];
            // Mostly sales, an occasional restock
            let delta = if seed % 7 == 0 { 12 } else { -((seed % 3) as i64 + 1) };
            let origin = &registers[n % registers.len()];

            let event = SyncEvent::new(
                &key,
                "stock.delta",
                json!({ "levels": { sku: delta } }),
                n as i64 + 2,
                origin.token(),
            )
            .with_scope(scope.clone().with_pos(format!("reg-{}", n % registers.len() + 1)));

            repo.insert(&event).await?;
            written += 1;
        }

        info!(entity = %key, events = events_per_store + 1, "Seeded entity");
    }

    let elapsed = start.elapsed();
    info!(
        written,
        elapsed_ms = elapsed.as_millis() as u64,
        "Seed complete"
    );

    Ok(())
}
