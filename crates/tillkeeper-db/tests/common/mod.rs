//! Shared fixtures for tillkeeper-db integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tillkeeper_core::{InvoiceView, PaymentPlan, Unit, UnitTag};
use tillkeeper_db::{AddToCart, Database, DbConfig, NewProduct, Receipt, RecordingInvalidator};

/// Tracked, 29.00, cost 12.00.
pub const SHIRT_L: &str = "shirt-l";
/// Tracked, 29.00, same article as SHIRT_L in another size.
pub const SHIRT_M: &str = "shirt-m";
/// Tracked, 40.00, untaxed.
pub const BELT: &str = "belt";
/// Tracked, 60.00, untaxed.
pub const CAP: &str = "cap";
/// Ledger-counted, 0.50.
pub const BAG: &str = "bag";

/// Bags received at the default location by every fixture.
pub const BAG_STOCK: i64 = 100;

pub struct TestStore {
    pub db: Database,
    pub cache: Arc<RecordingInvalidator>,
    _dir: Option<TempDir>,
}

impl TestStore {
    /// Single-connection in-memory database.
    pub async fn in_memory() -> Self {
        Self::build(DbConfig::in_memory(), None).await
    }

    /// WAL database file with a real connection pool, for contention tests.
    pub async fn file_backed(max_connections: u32, lock_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = DbConfig::new(dir.path().join("tillkeeper.db"))
            .max_connections(max_connections)
            .lock_timeout(lock_timeout);
        Self::build(config, Some(dir)).await
    }

    async fn build(config: DbConfig, dir: Option<TempDir>) -> Self {
        let cache = Arc::new(RecordingInvalidator::new());
        let db = Database::new(config)
            .await
            .expect("Failed to open database")
            .with_cache(cache.clone());

        let products = db.products();
        for product in [
            NewProduct::tracked("Oxford Shirt L", 2900).with_id(SHIRT_L).cost(1200),
            NewProduct::tracked("Oxford Shirt M", 2900).with_id(SHIRT_M).cost(1200),
            NewProduct::tracked("Leather Belt", 4000).with_id(BELT),
            NewProduct::tracked("Baseball Cap", 6000).with_id(CAP),
            NewProduct::untracked("Paper Bag", 50).with_id(BAG),
        ] {
            products.insert(product).await.expect("Failed to insert product");
        }
        db.units()
            .receive(Receipt::new("po-fixture", BAG, BAG_STOCK))
            .await
            .expect("Failed to stock bags");

        cache.clear();
        TestStore {
            db,
            cache,
            _dir: dir,
        }
    }

    pub async fn receive(&self, product_id: &str, qty: i64) -> Vec<Unit> {
        self.db
            .units()
            .receive(Receipt::new("po-test", product_id, qty))
            .await
            .expect("Failed to receive units")
    }

    pub async fn tag_of(&self, code: &str) -> UnitTag {
        self.db.units().resolve(code).await.expect("Unknown unit").tag
    }

    pub async fn bags_available(&self) -> i64 {
        self.db.stock().available(BAG, None).await.expect("Failed to read stock")
    }

    /// Scans each `(product, code)` into a fresh cart and settles it.
    pub async fn sell(&self, scans: &[(&str, &str)], paid_cents: i64) -> InvoiceView {
        let carts = self.db.carts();
        let cart = carts.open_cart(None).await.expect("Failed to open cart");
        for (product_id, code) in scans {
            carts
                .add_to_cart(&cart.id, AddToCart::scan(*product_id, *code))
                .await
                .expect("Failed to scan unit");
        }
        self.db
            .invoices()
            .settle_cart(&cart.id, PaymentPlan::single("card", paid_cents))
            .await
            .expect("Failed to settle cart")
    }
}
