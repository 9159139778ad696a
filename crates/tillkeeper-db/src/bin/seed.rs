//! # Seed Data Generator
//!
//! Populates a development database with products, received units and
//! ledger stock.
//!
//! ## Usage
//! ```bash
//! # Default: 5 units per tracked product, ./tillkeeper_dev.db
//! cargo run -p tillkeeper-db --bin seed
//!
//! # More units per tracked product
//! cargo run -p tillkeeper-db --bin seed -- --units 20
//!
//! # Explicit database / config file
//! cargo run -p tillkeeper-db --bin seed -- --db ./data/tillkeeper.db --config ./inventory.toml
//! ```
//!
//! ## Generated Data
//! - Tracked products (apparel, footwear): one `New` unit per item, each
//!   with a generated EAN-13 code, an alias and a queued label
//! - Non-tracked products (accessories): ledger quantity at the default
//!   location plus one representative unit

use std::env;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tillkeeper_db::{Database, InventoryConfig, LabelQueue, NewProduct, Receipt};

/// `(id, name, price_cents, cost_cents, tax_bps)`
const TRACKED: &[(&str, &str, i64, i64, i64)] = &[
    ("shirt-oxford-m", "Oxford Shirt M", 4900, 2100, 825),
    ("shirt-oxford-l", "Oxford Shirt L", 4900, 2100, 825),
    ("jeans-slim-32", "Slim Jeans 32", 7900, 3300, 825),
    ("jacket-denim", "Denim Jacket", 12900, 5800, 825),
    ("sneaker-canvas-42", "Canvas Sneaker 42", 6500, 2900, 825),
];

/// `(id, name, price_cents, tax_bps, quantity)`
const LEDGER: &[(&str, &str, i64, i64, i64)] = &[
    ("socks-crew", "Crew Socks", 900, 825, 120),
    ("laces-flat", "Flat Laces", 400, 825, 200),
    ("bag-paper", "Paper Bag", 25, 0, 1000),
];

/// Sets up logging the same way the POS terminals do.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tillkeeper=trace` - Trace for tillkeeper crates only
/// - Default: `info,tillkeeper=debug,sqlx=warn`
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tillkeeper=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args: Vec<String> = env::args().collect();

    let mut units_per_product: i64 = 5;
    let mut db_path: Option<PathBuf> = None;
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--units" | "-u" => {
                if i + 1 < args.len() {
                    units_per_product = args[i + 1].parse().unwrap_or(5);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tillkeeper Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -u, --units <N>      Units per tracked product (default: 5)");
                println!("  -d, --db <PATH>      Database file path (default: ./tillkeeper_dev.db)");
                println!("  -c, --config <PATH>  inventory.toml to load");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            other => warn!(argument = other, "Ignoring unknown argument"),
        }
        i += 1;
    }

    let config = InventoryConfig::load_or_default(config_path);
    let mut db_config = config.db_config();
    db_config.database_path = db_path.unwrap_or_else(|| PathBuf::from("./tillkeeper_dev.db"));

    println!("Tillkeeper Seed Data Generator");
    println!("==============================");
    println!("Database: {}", db_config.database_path.display());
    println!("Units per tracked product: {}", units_per_product);
    println!();

    let (labels, mut label_rx) = LabelQueue::channel(config.inventory.label_queue_capacity);
    let printer = tokio::spawn(async move {
        let mut printed = 0usize;
        while let Some(label) = label_rx.recv().await {
            tracing::debug!(code = %label.unit_code, alias = ?label.alias, "Label queued");
            printed += 1;
        }
        printed
    });

    let db = Database::new(db_config).await?.with_labels(labels);
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.products().count().await?;
    if existing > 0 {
        println!("⚠ Database already has {} products", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let start = std::time::Instant::now();
    let mut received = 0usize;

    for (index, (id, name, price, cost, tax)) in TRACKED.iter().enumerate() {
        db.products()
            .insert(
                NewProduct::tracked(*name, *price)
                    .with_id(*id)
                    .cost(*cost)
                    .tax_bps(*tax),
            )
            .await?;
        let units = db
            .units()
            .receive(Receipt::new(format!("seed-po-{}", index + 1), *id, units_per_product).cost(*cost))
            .await?;
        received += units.len();
    }

    for (id, name, price, tax, quantity) in LEDGER {
        db.products()
            .insert(NewProduct::untracked(*name, *price).with_id(*id).tax_bps(*tax))
            .await?;
        db.units()
            .receive(Receipt::new("seed-po-ledger", *id, *quantity))
            .await?;
    }

    // Dropping the database handle closes the label channel
    drop(db);
    let printed = printer.await.unwrap_or(0);

    let elapsed = start.elapsed();
    info!(units = received, labels = printed, ?elapsed, "Seed complete");
    println!();
    println!("✓ Received {} tracked units ({} labels queued) in {:?}", received, printed, elapsed);
    println!("✓ Stocked {} ledger products", LEDGER.len());

    Ok(())
}
