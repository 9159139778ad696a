//! # Stock Ledger
//!
//! Aggregate quantity per `(product, variant, location)` for non-tracked
//! products. Both directions are single guarded statements:
//!
//! ```text
//! reserve:  UPDATE stock_levels SET quantity = quantity - n
//!           WHERE ... AND quantity >= n          0 rows → InsufficientStock
//!
//! restore:  INSERT ... ON CONFLICT DO UPDATE
//!           SET quantity = quantity + n          n > 0 only
//! ```
//!
//! `CHECK (quantity >= 0)` on the table keeps every row at or above zero. A
//! restore of zero or less means the caller's books are off: it is logged as
//! an anomaly and the row is left as is.
//!
//! No read ever decides a write here; [`StockLedger::available`] is for
//! display only.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use tillkeeper_core::{variant_key, CoreError, StockLevel, ValidationError};

use crate::audit::AuditEntry;
use crate::cache::{stock_key, STOCK_SUMMARY_KEY};
use crate::effects::Effects;
use crate::error::DbResult;
use crate::pool::{begin_write, Hooks};

#[derive(Debug, Clone)]
pub struct StockLedger {
    pool: SqlitePool,
    hooks: Hooks,
}

impl StockLedger {
    pub fn new(pool: SqlitePool, hooks: Hooks) -> Self {
        StockLedger { pool, hooks }
    }

    /// Takes `qty` off the shelf at `location_id`.
    pub async fn reserve(
        &self,
        product_id: &str,
        variant_id: Option<&str>,
        location_id: &str,
        qty: i64,
    ) -> DbResult<()> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);
        reserve_in(&mut tx, &mut fx, product_id, variant_id, location_id, qty, None).await?;
        tx.commit().await?;
        fx.release();
        Ok(())
    }

    /// Puts `qty` back at `location_id`.
    pub async fn restore(
        &self,
        product_id: &str,
        variant_id: Option<&str>,
        location_id: &str,
        qty: i64,
    ) -> DbResult<()> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);
        restore_in(&mut tx, &mut fx, product_id, variant_id, location_id, qty, None).await?;
        tx.commit().await?;
        fx.release();
        Ok(())
    }

    /// Quantity across every location.
    pub async fn available(&self, product_id: &str, variant_id: Option<&str>) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        available_in(&mut conn, product_id, variant_id).await
    }

    /// The row for one location, if it was ever stocked.
    pub async fn level(
        &self,
        product_id: &str,
        variant_id: Option<&str>,
        location_id: &str,
    ) -> DbResult<Option<StockLevel>> {
        let level = sqlx::query_as::<_, StockLevel>(
            r#"
            SELECT product_id, variant_id, location_id, quantity, updated_at
            FROM stock_levels
            WHERE product_id = ?1 AND variant_id = ?2 AND location_id = ?3
            "#,
        )
        .bind(product_id)
        .bind(variant_key(variant_id))
        .bind(location_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(level)
    }
}

// =============================================================================
// Transaction-Scoped Operations
// =============================================================================

fn ensure_positive(qty: i64) -> DbResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        }
        .into());
    }
    Ok(())
}

pub(crate) async fn reserve_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    product_id: &str,
    variant_id: Option<&str>,
    location_id: &str,
    qty: i64,
    correlation: Option<&str>,
) -> DbResult<()> {
    ensure_positive(qty)?;
    let variant = variant_key(variant_id);

    let result = sqlx::query(
        r#"
        UPDATE stock_levels
        SET quantity = quantity - ?1, updated_at = ?2
        WHERE product_id = ?3 AND variant_id = ?4 AND location_id = ?5
          AND quantity >= ?1
        "#,
    )
    .bind(qty)
    .bind(Utc::now())
    .bind(product_id)
    .bind(variant)
    .bind(location_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let available: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(quantity), 0) FROM stock_levels
            WHERE product_id = ?1 AND variant_id = ?2 AND location_id = ?3
            "#,
        )
        .bind(product_id)
        .bind(variant)
        .bind(location_id)
        .fetch_one(&mut *conn)
        .await?;

        return Err(CoreError::InsufficientStock {
            product_id: product_id.to_string(),
            available,
            requested: qty,
        }
        .into());
    }

    fx.hooks
        .audit
        .record(
            conn,
            AuditEntry::new("stock.reserve", "product", product_id)
                .after(serde_json::json!({
                    "variant_id": variant,
                    "location_id": location_id,
                    "delta": -qty,
                }))
                .correlated(correlation),
        )
        .await;
    fx.batch.extend([stock_key(product_id), STOCK_SUMMARY_KEY.to_string()]);

    debug!(product_id, variant, location_id, qty, "Stock reserved");
    Ok(())
}

pub(crate) async fn restore_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    product_id: &str,
    variant_id: Option<&str>,
    location_id: &str,
    qty: i64,
    correlation: Option<&str>,
) -> DbResult<()> {
    if qty <= 0 {
        warn!(product_id, location_id, qty, "Ignoring non-positive stock restore");
        return Ok(());
    }
    let variant = variant_key(variant_id);

    sqlx::query(
        r#"
        INSERT INTO stock_levels (product_id, variant_id, location_id, quantity, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (product_id, variant_id, location_id) DO UPDATE
        SET quantity = stock_levels.quantity + excluded.quantity,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(product_id)
    .bind(variant)
    .bind(location_id)
    .bind(qty)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    fx.hooks
        .audit
        .record(
            conn,
            AuditEntry::new("stock.restore", "product", product_id)
                .after(serde_json::json!({
                    "variant_id": variant,
                    "location_id": location_id,
                    "delta": qty,
                }))
                .correlated(correlation),
        )
        .await;
    fx.batch.extend([stock_key(product_id), STOCK_SUMMARY_KEY.to_string()]);

    debug!(product_id, variant, location_id, qty, "Stock restored");
    Ok(())
}

pub(crate) async fn available_in(
    conn: &mut SqliteConnection,
    product_id: &str,
    variant_id: Option<&str>,
) -> DbResult<i64> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(quantity), 0) FROM stock_levels WHERE product_id = ?1 AND variant_id = ?2",
    )
    .bind(product_id)
    .bind(variant_key(variant_id))
    .fetch_one(conn)
    .await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::pool::{Database, DbConfig};
    use crate::repository::product::NewProduct;

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.products()
            .insert(NewProduct::untracked("Gift Wrap", 150).with_id("wrap"))
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_reserve_cannot_go_negative() {
        let db = setup().await;
        let stock = db.stock();
        stock.restore("wrap", None, "main", 3).await.unwrap();

        stock.reserve("wrap", None, "main", 2).await.unwrap();
        let err = stock.reserve("wrap", None, "main", 2).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Domain(CoreError::InsufficientStock {
                available: 1,
                requested: 2,
                ..
            })
        ));
        assert_eq!(stock.available("wrap", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reserve_unknown_row_is_insufficient() {
        let db = setup().await;
        let err = db.stock().reserve("wrap", None, "annex", 1).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Domain(CoreError::InsufficientStock { available: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_available_sums_locations() {
        let db = setup().await;
        let stock = db.stock();
        stock.restore("wrap", None, "main", 4).await.unwrap();
        stock.restore("wrap", None, "annex", 6).await.unwrap();
        stock.restore("wrap", Some("red"), "main", 9).await.unwrap();

        assert_eq!(stock.available("wrap", None).await.unwrap(), 10);
        assert_eq!(stock.available("wrap", Some("red")).await.unwrap(), 9);
        let level = stock.level("wrap", None, "annex").await.unwrap().unwrap();
        assert_eq!(level.quantity, 6);
    }

    #[tokio::test]
    async fn test_negative_restore_is_ignored() {
        let db = setup().await;
        let stock = db.stock();
        stock.restore("wrap", None, "main", 2).await.unwrap();
        stock.restore("wrap", None, "main", -5).await.unwrap();
        stock.restore("wrap", None, "main", 0).await.unwrap();
        assert_eq!(stock.available("wrap", None).await.unwrap(), 2);

        // Nothing is created for a location that was never stocked
        stock.restore("wrap", None, "annex", -1).await.unwrap();
        assert!(stock.level("wrap", None, "annex").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_after_reserve_adds_back() {
        let db = setup().await;
        let stock = db.stock();
        stock.restore("wrap", None, "main", 5).await.unwrap();
        stock.reserve("wrap", None, "main", 5).await.unwrap();
        assert_eq!(stock.available("wrap", None).await.unwrap(), 0);

        stock.restore("wrap", None, "main", 3).await.unwrap();
        let level = stock.level("wrap", None, "main").await.unwrap().unwrap();
        assert_eq!(level.quantity, 3);
    }
}
