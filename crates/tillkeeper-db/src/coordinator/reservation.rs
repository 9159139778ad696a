//! # Reservation Coordinator
//!
//! Cart side of a sale. Turns "add", "decrement", "remove" and "abandon"
//! into unit claims and releases (tracked products) or ledger reservations
//! (non-tracked products), keeping each line's quantity equal to what it
//! actually holds.
//!
//! ## Cart Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  open_cart() → Cart { status: open }                                   │
//! │                                                                         │
//! │  add_to_cart(scan A100)      resolve → match product → price floor     │
//! │                              → claim (New|Returned → InCart)           │
//! │  add_to_cart(qty 3)          find_available × 3, skipping units held   │
//! │                              by any open cart                           │
//! │  add_to_cart(non-tracked)    ledger reserve at the cart's location     │
//! │                                                                         │
//! │  decrement_line / remove_line  release newest claims first             │
//! │                                                                         │
//! │  ├── settle_cart()   → status: settled   (settlement coordinator)      │
//! │  └── abandon_cart()  → status: abandoned, every claim released         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A scanned code is never substituted: if that exact unit cannot be
//! claimed the add fails with `NotAvailable`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tillkeeper_core::validation::{check_price_floor, validate_price_cents, validate_quantity};
use tillkeeper_core::{
    Cart, CartLine, CartStatus, CartView, CoreError, Product, Unit, UnitTag, ValidationError,
};

use crate::audit::AuditEntry;
use crate::cache::cart_key;
use crate::effects::Effects;
use crate::error::{DbError, DbResult};
use crate::pool::{begin_write, Hooks};
use crate::repository::{product, stock, unit};

// =============================================================================
// Requests
// =============================================================================

/// One "add to cart" action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddToCart {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    /// Exact unit the cashier scanned. Requires `quantity == 1`.
    pub scanned_code: Option<String>,
    /// Cashier-entered price; checked against the cost floor.
    pub manual_price_cents: Option<i64>,
}

impl AddToCart {
    pub fn new(product_id: impl Into<String>, quantity: i64) -> Self {
        AddToCart {
            product_id: product_id.into(),
            variant_id: None,
            quantity,
            scanned_code: None,
            manual_price_cents: None,
        }
    }

    /// A single scanned unit.
    pub fn scan(product_id: impl Into<String>, code: impl Into<String>) -> Self {
        AddToCart {
            scanned_code: Some(code.into()),
            ..Self::new(product_id, 1)
        }
    }

    pub fn variant(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    pub fn manual_price(mut self, cents: i64) -> Self {
        self.manual_price_cents = Some(cents);
        self
    }

    fn validate(&self) -> DbResult<()> {
        validate_quantity(self.quantity)?;
        if let Some(price) = self.manual_price_cents {
            validate_price_cents(price)?;
        }
        if self.scanned_code.is_some() && self.quantity != 1 {
            return Err(ValidationError::OutOfRange {
                field: "quantity".to_string(),
                min: 1,
                max: 1,
            }
            .into());
        }
        Ok(())
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Debug, Clone)]
pub struct ReservationCoordinator {
    pool: SqlitePool,
    hooks: Hooks,
}

impl ReservationCoordinator {
    pub fn new(pool: SqlitePool, hooks: Hooks) -> Self {
        ReservationCoordinator { pool, hooks }
    }

    /// Opens an empty cart. `None` uses the configured default location.
    pub async fn open_cart(&self, location_id: Option<&str>) -> DbResult<Cart> {
        let now = Utc::now();
        let cart = Cart {
            id: Uuid::new_v4().to_string(),
            location_id: location_id
                .map(str::to_string)
                .unwrap_or_else(|| self.hooks.settings.default_location.clone()),
            status: CartStatus::Open,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO carts (id, location_id, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(&cart.id)
        .bind(&cart.location_id)
        .bind(cart.status)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(cart_id = %cart.id, location_id = %cart.location_id, "Cart opened");
        Ok(cart)
    }

    pub async fn get_cart(&self, cart_id: &str) -> DbResult<CartView> {
        let mut conn = self.pool.acquire().await?;
        let cart = load_cart_in(&mut conn, cart_id).await?;
        let lines = lines_in(&mut conn, cart_id).await?;
        Ok(CartView { cart, lines })
    }

    /// Adds items to an open cart and returns the affected line.
    ///
    /// Repeated adds of the same product, variant and price grow one line.
    pub async fn add_to_cart(&self, cart_id: &str, request: AddToCart) -> DbResult<CartLine> {
        request.validate()?;
        debug!(
            cart_id,
            product_id = %request.product_id,
            quantity = request.quantity,
            scanned = request.scanned_code.as_deref().unwrap_or("-"),
            "Adding to cart"
        );

        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let cart = open_cart_in(&mut tx, cart_id).await?;
        let product = product::get_in(&mut tx, &request.product_id).await?;
        let variant = request.variant_id.as_deref();

        let (price, claimed) = if !product.tracked {
            let price = request.manual_price_cents.unwrap_or(product.price_cents);
            if request.manual_price_cents.is_some() {
                check_price_floor(&product, None, price)?;
            }
            stock::reserve_in(
                &mut tx,
                &mut fx,
                &product.id,
                variant,
                &cart.location_id,
                request.quantity,
                Some(&cart.id),
            )
            .await?;
            (price, Vec::new())
        } else if let Some(code) = request.scanned_code.as_deref() {
            let scanned =
                claim_scanned_in(&mut tx, &mut fx, &cart, &product, variant, code, &request)
                    .await?;
            let price = request
                .manual_price_cents
                .or(scanned.price_cents)
                .unwrap_or(product.price_cents);
            (price, vec![scanned.code])
        } else {
            let price = request.manual_price_cents.unwrap_or(product.price_cents);
            let codes = claim_any_in(
                &mut tx,
                &mut fx,
                &cart,
                &product,
                variant,
                request.quantity,
                request.manual_price_cents,
            )
            .await?;
            (price, codes)
        };

        let line_id = merge_line_in(
            &mut tx,
            &cart,
            &product,
            variant,
            request.quantity,
            price,
            request.manual_price_cents.is_some(),
        )
        .await?;
        for code in &claimed {
            sqlx::query("INSERT INTO cart_line_units (cart_line_id, unit_code) VALUES (?1, ?2)")
                .bind(&line_id)
                .bind(code)
                .execute(&mut *tx)
                .await?;
        }
        touch_cart_in(&mut tx, &cart.id).await?;

        self.hooks
            .audit
            .record(
                &mut tx,
                AuditEntry::new("cart.add", "cart_line", &line_id)
                    .after(serde_json::json!({
                        "product_id": product.id,
                        "variant_id": variant,
                        "quantity": request.quantity,
                        "units": claimed,
                    }))
                    .correlated(Some(&cart.id)),
            )
            .await;
        fx.batch.add(cart_key(&cart.id));

        let line = load_line_in(&mut tx, &line_id).await?;
        tx.commit().await?;
        fx.release();

        info!(cart_id = %cart.id, line_id = %line.id, quantity = line.quantity, "Cart line updated");
        Ok(line)
    }

    /// Removes a line, releasing its units or restoring its ledger quantity.
    pub async fn remove_line(&self, cart_id: &str, line_id: &str) -> DbResult<()> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let cart = open_cart_in(&mut tx, cart_id).await?;
        let line = owned_line_in(&mut tx, &cart, line_id).await?;
        let quantity = line.quantity;
        shrink_line_in(&mut tx, &mut fx, &cart, &line, quantity).await?;
        touch_cart_in(&mut tx, &cart.id).await?;
        fx.batch.add(cart_key(&cart.id));

        tx.commit().await?;
        fx.release();

        info!(cart_id, line_id, "Cart line removed");
        Ok(())
    }

    /// Gives back `by` items of a line. Returns the shrunk line, or `None`
    /// when the line reached zero and was removed.
    pub async fn decrement_line(
        &self,
        cart_id: &str,
        line_id: &str,
        by: i64,
    ) -> DbResult<Option<CartLine>> {
        validate_quantity(by)?;

        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let cart = open_cart_in(&mut tx, cart_id).await?;
        let line = owned_line_in(&mut tx, &cart, line_id).await?;
        if by > line.quantity {
            return Err(ValidationError::OutOfRange {
                field: "quantity".to_string(),
                min: 1,
                max: line.quantity,
            }
            .into());
        }

        shrink_line_in(&mut tx, &mut fx, &cart, &line, by).await?;
        touch_cart_in(&mut tx, &cart.id).await?;
        fx.batch.add(cart_key(&cart.id));

        let remaining = if by == line.quantity {
            None
        } else {
            Some(load_line_in(&mut tx, line_id).await?)
        };

        tx.commit().await?;
        fx.release();

        debug!(cart_id, line_id, by, removed = remaining.is_none(), "Cart line decremented");
        Ok(remaining)
    }

    /// Releases every claim of an open cart in one transaction.
    ///
    /// Abandoning an abandoned cart is a no-op. `notify_cache = false`
    /// suppresses cache notices for this call only, for bulk cleanups.
    pub async fn abandon_cart(&self, cart_id: &str, notify_cache: bool) -> DbResult<()> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let closed = sqlx::query(
            "UPDATE carts SET status = 'abandoned', updated_at = ?1 WHERE id = ?2 AND status = 'open'",
        )
        .bind(Utc::now())
        .bind(cart_id)
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() == 0 {
            let cart = load_cart_in(&mut tx, cart_id).await?;
            return match cart.status {
                CartStatus::Abandoned => {
                    debug!(cart_id, "Cart already abandoned");
                    Ok(())
                }
                status => Err(CoreError::CartNotOpen {
                    cart_id: cart_id.to_string(),
                    status: status.to_string(),
                }
                .into()),
            };
        }

        let cart = load_cart_in(&mut tx, cart_id).await?;
        let lines = lines_in(&mut tx, cart_id).await?;

        // One ordered pass over every unit of the cart
        let codes: Vec<String> = lines
            .iter()
            .flat_map(|l| l.claimed_units.iter().cloned())
            .collect();
        for held in unit::resolve_ordered_in(&mut tx, &codes).await? {
            unit::release_in(&mut tx, &mut fx, &held.code, Some(&cart.id)).await?;
        }
        for line in lines.iter().filter(|l| !l.tracked) {
            stock::restore_in(
                &mut tx,
                &mut fx,
                &line.product_id,
                line.variant_id.as_deref(),
                &cart.location_id,
                line.quantity,
                Some(&cart.id),
            )
            .await?;
        }
        delete_cart_lines_in(&mut tx, cart_id).await?;

        self.hooks
            .audit
            .record(
                &mut tx,
                AuditEntry::new("cart.abandon", "cart", cart_id)
                    .before(CartStatus::Open)
                    .after(CartStatus::Abandoned),
            )
            .await;
        fx.batch.add(cart_key(cart_id));

        tx.commit().await?;
        fx.release_if(notify_cache);

        info!(cart_id, lines = lines.len(), units = codes.len(), "Cart abandoned");
        Ok(())
    }
}

// =============================================================================
// Claiming
// =============================================================================

async fn claim_scanned_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    cart: &Cart,
    product: &Product,
    variant_id: Option<&str>,
    code: &str,
    request: &AddToCart,
) -> DbResult<Unit> {
    let unit = unit::resolve_in(conn, code).await?;
    unit.ensure_matches(&product.id, variant_id)?;

    if let Some(price) = request.manual_price_cents {
        check_price_floor(product, unit.cost_cents, price)?;
    }

    unit::claim_resolved_in(conn, fx, &unit, Some(&cart.id))
        .await
        .map_err(strict_scan_error)
}

/// The scanned unit is the only acceptable one, whatever the reason it
/// cannot be claimed.
fn strict_scan_error(err: DbError) -> DbError {
    match err {
        DbError::Domain(CoreError::AlreadyClaimed { code, held_by }) => {
            DbError::Domain(CoreError::NotAvailable {
                code,
                tag: UnitTag::InCart,
                held_by,
            })
        }
        other => other,
    }
}

/// Claims `quantity` units of any identity.
async fn claim_any_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    cart: &Cart,
    product: &Product,
    variant_id: Option<&str>,
    quantity: i64,
    manual_price: Option<i64>,
) -> DbResult<Vec<String>> {
    let max_attempts = fx.hooks.settings.max_claim_attempts.max(1);
    let mut excluding: BTreeSet<String> = unit::open_cart_claims_in(conn).await?;
    let mut claimed = Vec::with_capacity(quantity as usize);
    let mut failures = 0u32;

    while (claimed.len() as i64) < quantity {
        let candidate = unit::find_available_in(conn, &product.id, variant_id, &excluding).await?;
        let Some(candidate) = candidate else {
            return Err(CoreError::InsufficientStock {
                product_id: product.id.clone(),
                available: claimed.len() as i64,
                requested: quantity,
            }
            .into());
        };

        if let Some(price) = manual_price {
            check_price_floor(product, candidate.cost_cents, price)?;
        }

        excluding.insert(candidate.code.clone());
        match unit::claim_resolved_in(conn, fx, &candidate, Some(&cart.id)).await {
            Ok(unit) => claimed.push(unit.code),
            Err(DbError::Domain(
                err @ (CoreError::AlreadyClaimed { .. }
                | CoreError::NotAvailable { .. }
                | CoreError::InvalidTransition { .. }),
            )) => {
                failures += 1;
                warn!(code = %candidate.code, error = %err, failures, "Claim lost, picking another unit");
                if failures >= max_attempts {
                    return Err(err.into());
                }
            }
            Err(other) => return Err(other),
        }
    }

    Ok(claimed)
}

// =============================================================================
// Line Maintenance
// =============================================================================

/// Grows a matching line or inserts a new one. Returns the line id.
async fn merge_line_in(
    conn: &mut SqliteConnection,
    cart: &Cart,
    product: &Product,
    variant_id: Option<&str>,
    quantity: i64,
    unit_price_cents: i64,
    manual_price: bool,
) -> DbResult<String> {
    let existing: Option<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM cart_lines
        WHERE cart_id = ?1 AND product_id = ?2 AND variant_id IS ?3
          AND unit_price_cents = ?4 AND manual_price = ?5
        ORDER BY created_at
        LIMIT 1
        "#,
    )
    .bind(&cart.id)
    .bind(&product.id)
    .bind(variant_id)
    .bind(unit_price_cents)
    .bind(manual_price)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(line_id) = existing {
        sqlx::query("UPDATE cart_lines SET quantity = quantity + ?1 WHERE id = ?2")
            .bind(quantity)
            .bind(&line_id)
            .execute(&mut *conn)
            .await?;
        return Ok(line_id);
    }

    let line_id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO cart_lines (
            id, cart_id, product_id, variant_id, quantity,
            unit_price_cents, manual_price, tracked, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&line_id)
    .bind(&cart.id)
    .bind(&product.id)
    .bind(variant_id)
    .bind(quantity)
    .bind(unit_price_cents)
    .bind(manual_price)
    .bind(product.tracked)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(line_id)
}

/// Gives back `by` items of `line`, newest claims first, and deletes the
/// line when nothing is left.
async fn shrink_line_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    cart: &Cart,
    line: &CartLine,
    by: i64,
) -> DbResult<()> {
    if line.tracked {
        let keep = line.claimed_units.len().saturating_sub(by as usize);
        let released = &line.claimed_units[keep..];

        for held in unit::resolve_ordered_in(conn, released).await? {
            unit::release_in(conn, fx, &held.code, Some(&cart.id)).await?;
        }
        for code in released {
            sqlx::query("DELETE FROM cart_line_units WHERE cart_line_id = ?1 AND unit_code = ?2")
                .bind(&line.id)
                .bind(code)
                .execute(&mut *conn)
                .await?;
        }
    } else {
        stock::restore_in(
            conn,
            fx,
            &line.product_id,
            line.variant_id.as_deref(),
            &cart.location_id,
            by,
            Some(&cart.id),
        )
        .await?;
    }

    if by >= line.quantity {
        sqlx::query("DELETE FROM cart_line_units WHERE cart_line_id = ?1")
            .bind(&line.id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM cart_lines WHERE id = ?1")
            .bind(&line.id)
            .execute(&mut *conn)
            .await?;
    } else {
        sqlx::query("UPDATE cart_lines SET quantity = quantity - ?1 WHERE id = ?2")
            .bind(by)
            .bind(&line.id)
            .execute(&mut *conn)
            .await?;
    }

    fx.hooks
        .audit
        .record(
            conn,
            AuditEntry::new("cart.release", "cart_line", &line.id)
                .before(serde_json::json!({ "quantity": line.quantity }))
                .after(serde_json::json!({ "quantity": line.quantity - by }))
                .correlated(Some(&cart.id)),
        )
        .await;
    Ok(())
}

async fn touch_cart_in(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<()> {
    sqlx::query("UPDATE carts SET updated_at = ?1 WHERE id = ?2")
        .bind(Utc::now())
        .bind(cart_id)
        .execute(conn)
        .await?;
    Ok(())
}

// =============================================================================
// Loading (shared with settlement)
// =============================================================================

const SELECT_LINE: &str = r#"
    SELECT id, cart_id, product_id, variant_id, quantity, unit_price_cents,
           manual_price, tracked, created_at
    FROM cart_lines
"#;

pub(crate) async fn load_cart_in(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Cart> {
    sqlx::query_as::<_, Cart>(
        "SELECT id, location_id, status, created_at, updated_at FROM carts WHERE id = ?1",
    )
    .bind(cart_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| CoreError::record_not_found("Cart", cart_id).into())
}

/// Loads a cart and insists it is still open.
pub(crate) async fn open_cart_in(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Cart> {
    let cart = load_cart_in(conn, cart_id).await?;
    if cart.status != CartStatus::Open {
        return Err(CoreError::CartNotOpen {
            cart_id: cart.id,
            status: cart.status.to_string(),
        }
        .into());
    }
    Ok(cart)
}

async fn claimed_units_in(conn: &mut SqliteConnection, line_id: &str) -> DbResult<Vec<String>> {
    let codes: Vec<String> = sqlx::query_scalar(
        "SELECT unit_code FROM cart_line_units WHERE cart_line_id = ?1 ORDER BY seq",
    )
    .bind(line_id)
    .fetch_all(conn)
    .await?;
    Ok(codes)
}

pub(crate) async fn load_line_in(conn: &mut SqliteConnection, line_id: &str) -> DbResult<CartLine> {
    let mut line = sqlx::query_as::<_, CartLine>(&format!("{} WHERE id = ?1", SELECT_LINE))
        .bind(line_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DbError::from(CoreError::record_not_found("CartLine", line_id)))?;
    line.claimed_units = claimed_units_in(conn, &line.id).await?;
    Ok(line)
}

async fn owned_line_in(conn: &mut SqliteConnection, cart: &Cart, line_id: &str) -> DbResult<CartLine> {
    let line = load_line_in(conn, line_id).await?;
    if line.cart_id != cart.id {
        return Err(CoreError::record_not_found("CartLine", line_id).into());
    }
    Ok(line)
}

/// Every line of a cart with its claimed codes, oldest line first.
pub(crate) async fn lines_in(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Vec<CartLine>> {
    let mut lines = sqlx::query_as::<_, CartLine>(&format!(
        "{} WHERE cart_id = ?1 ORDER BY created_at, id",
        SELECT_LINE
    ))
    .bind(cart_id)
    .fetch_all(&mut *conn)
    .await?;

    for line in &mut lines {
        line.claimed_units = claimed_units_in(conn, &line.id).await?;
    }
    Ok(lines)
}

pub(crate) async fn delete_cart_lines_in(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<()> {
    sqlx::query(
        "DELETE FROM cart_line_units WHERE cart_line_id IN (SELECT id FROM cart_lines WHERE cart_id = ?1)",
    )
    .bind(cart_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM cart_lines WHERE cart_id = ?1")
        .bind(cart_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use crate::repository::{NewProduct, Receipt};

    async fn setup() -> (Database, Vec<Unit>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.products()
            .insert(NewProduct::tracked("Denim Jacket", 8900).with_id("jacket").cost(4000))
            .await
            .unwrap();
        db.products()
            .insert(NewProduct::untracked("Shopping Bag", 50).with_id("bag"))
            .await
            .unwrap();
        let units = db.units().receive(Receipt::new("po-1", "jacket", 3).cost(4000)).await.unwrap();
        db.units().receive(Receipt::new("po-1", "bag", 10)).await.unwrap();
        (db, units)
    }

    #[test]
    fn test_scan_requires_quantity_one() {
        let mut request = AddToCart::scan("jacket", "A100");
        request.quantity = 2;
        assert!(request.validate().is_err());
        assert!(AddToCart::new("jacket", 0).validate().is_err());
        assert!(AddToCart::new("jacket", 3).validate().is_ok());
    }

    #[tokio::test]
    async fn test_repeated_adds_merge() {
        let (db, _) = setup().await;
        let carts = db.carts();
        let cart = carts.open_cart(None).await.unwrap();

        carts.add_to_cart(&cart.id, AddToCart::new("jacket", 1)).await.unwrap();
        let line = carts.add_to_cart(&cart.id, AddToCart::new("jacket", 2)).await.unwrap();

        assert_eq!(line.quantity, 3);
        assert_eq!(line.claimed_units.len(), 3);
        assert!(line.is_consistent());
        assert_eq!(carts.get_cart(&cart.id).await.unwrap().lines.len(), 1);
    }

    #[tokio::test]
    async fn test_unscanned_add_skips_other_carts() {
        let (db, units) = setup().await;
        let carts = db.carts();
        let first = carts.open_cart(None).await.unwrap();
        let second = carts.open_cart(None).await.unwrap();

        carts
            .add_to_cart(&first.id, AddToCart::scan("jacket", &units[0].code))
            .await
            .unwrap();
        let line = carts.add_to_cart(&second.id, AddToCart::new("jacket", 2)).await.unwrap();
        assert!(!line.claimed_units.contains(&units[0].code));

        let err = carts.add_to_cart(&second.id, AddToCart::new("jacket", 1)).await.unwrap_err();
        assert!(matches!(err, DbError::Domain(CoreError::InsufficientStock { .. })));
    }

    #[tokio::test]
    async fn test_decrement_releases_newest_claim() {
        let (db, _) = setup().await;
        let carts = db.carts();
        let cart = carts.open_cart(None).await.unwrap();
        let line = carts.add_to_cart(&cart.id, AddToCart::new("jacket", 2)).await.unwrap();
        let newest = line.claimed_units[1].clone();

        let shrunk = carts.decrement_line(&cart.id, &line.id, 1).await.unwrap().unwrap();
        assert_eq!(shrunk.quantity, 1);
        assert_eq!(shrunk.claimed_units, vec![line.claimed_units[0].clone()]);
        assert_eq!(db.units().resolve(&newest).await.unwrap().tag, UnitTag::New);

        assert!(carts.decrement_line(&cart.id, &line.id, 1).await.unwrap().is_none());
        assert!(carts.get_cart(&cart.id).await.unwrap().lines.is_empty());
    }

    #[tokio::test]
    async fn test_non_tracked_line_reserves_ledger() {
        let (db, _) = setup().await;
        let carts = db.carts();
        let cart = carts.open_cart(None).await.unwrap();

        let line = carts.add_to_cart(&cart.id, AddToCart::new("bag", 4)).await.unwrap();
        assert!(line.claimed_units.is_empty());
        assert_eq!(db.stock().available("bag", None).await.unwrap(), 6);

        carts.remove_line(&cart.id, &line.id).await.unwrap();
        assert_eq!(db.stock().available("bag", None).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_price_floor_rejected_before_claim() {
        let (db, units) = setup().await;
        let carts = db.carts();
        let cart = carts.open_cart(None).await.unwrap();

        let err = carts
            .add_to_cart(
                &cart.id,
                AddToCart::scan("jacket", &units[0].code).manual_price(3000),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Domain(CoreError::PriceBelowFloor { .. })));
        assert_eq!(db.units().resolve(&units[0].code).await.unwrap().tag, UnitTag::New);
    }

    #[tokio::test]
    async fn test_abandon_twice_is_noop() {
        let (db, _) = setup().await;
        let carts = db.carts();
        let cart = carts.open_cart(None).await.unwrap();
        let line = carts.add_to_cart(&cart.id, AddToCart::new("jacket", 2)).await.unwrap();
        carts.add_to_cart(&cart.id, AddToCart::new("bag", 3)).await.unwrap();

        carts.abandon_cart(&cart.id, true).await.unwrap();
        carts.abandon_cart(&cart.id, true).await.unwrap();

        for code in &line.claimed_units {
            assert_eq!(db.units().resolve(code).await.unwrap().tag, UnitTag::New);
        }
        assert_eq!(db.stock().available("bag", None).await.unwrap(), 10);

        let err = carts.add_to_cart(&cart.id, AddToCart::new("bag", 1)).await.unwrap_err();
        assert!(matches!(err, DbError::Domain(CoreError::CartNotOpen { .. })));
    }
}
