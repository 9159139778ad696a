//! # Unit Registry
//!
//! Owns the `units` table. Every tag change in the system goes through
//! [`apply_in`], which checks the transition table, performs a
//! compare-and-set on `(id, tag)`, writes the audit row and queues cache
//! keys for the unit's code and alias.
//!
//! ## Two Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  UnitRegistry (pub)        one transaction per call                     │
//! │     try_claim / release / settle / update_tag / receive / ...           │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  *_in(conn, fx, ...) (crate)   run on a caller's transaction           │
//! │     used by the cart, invoice and replacement coordinators so that a   │
//! │     multi-unit operation commits or rolls back as one                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeSet;
use tracing::{debug, info};
use uuid::Uuid;

use tillkeeper_core::tag::{check_operator_update, check_transition, claim_refusal};
use tillkeeper_core::validation::{ean13_check_digit, validate_code};
use tillkeeper_core::{
    CoreError, LabelRequest, Trigger, Unit, UnitTag, ValidationError, UNIT_ALIAS_LEN,
};

use crate::audit::AuditEntry;
use crate::cache::{stock_key, PRODUCTS_LIST_KEY, STOCK_SUMMARY_KEY};
use crate::effects::Effects;
use crate::error::{DbError, DbResult};
use crate::pool::{begin_write, Hooks};
use crate::repository::{product, stock};

const SELECT_UNIT: &str = r#"
    SELECT id, code, alias, tag, product_id, variant_id, purchase_id,
           purchase_line_id, is_primary, cost_cents, price_cents, ever_sold,
           created_at, updated_at
    FROM units
"#;

/// Attempts at drawing a code/alias pair nobody holds yet.
const CODE_ATTEMPTS: usize = 8;

/// Alias alphabet without 0/O and 1/I.
const ALIAS_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

// =============================================================================
// Receipts
// =============================================================================

/// Goods received against one purchase line.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub purchase_id: String,
    pub purchase_line_id: Option<String>,
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    /// Purchase cost per item, the floor for manual prices.
    pub cost_cents: Option<i64>,
    /// Selling price per item. Defaults to the catalog price.
    pub price_cents: Option<i64>,
    /// Ledger location for non-tracked products. Defaults to the configured one.
    pub location_id: Option<String>,
}

impl Receipt {
    pub fn new(purchase_id: impl Into<String>, product_id: impl Into<String>, quantity: i64) -> Self {
        Receipt {
            purchase_id: purchase_id.into(),
            purchase_line_id: None,
            product_id: product_id.into(),
            variant_id: None,
            quantity,
            cost_cents: None,
            price_cents: None,
            location_id: None,
        }
    }

    pub fn variant(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    pub fn cost(mut self, cost_cents: i64) -> Self {
        self.cost_cents = Some(cost_cents);
        self
    }

    pub fn location(mut self, location_id: impl Into<String>) -> Self {
        self.location_id = Some(location_id.into());
        self
    }
}

// =============================================================================
// Public Registry
// =============================================================================

#[derive(Debug, Clone)]
pub struct UnitRegistry {
    pool: SqlitePool,
    hooks: Hooks,
}

impl UnitRegistry {
    pub fn new(pool: SqlitePool, hooks: Hooks) -> Self {
        UnitRegistry { pool, hooks }
    }

    /// Records received goods.
    ///
    /// Tracked products get one `New` unit per item with a generated EAN-13
    /// code and a short alias, plus one label request each. Non-tracked
    /// products raise the stock ledger and get a single representative unit
    /// the first time they are received.
    pub async fn receive(&self, receipt: Receipt) -> DbResult<Vec<Unit>> {
        if receipt.quantity <= 0 {
            return Err(ValidationError::MustBePositive {
                field: "quantity".to_string(),
            }
            .into());
        }

        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let product = product::get_in(&mut tx, &receipt.product_id).await?;
        let variant = receipt.variant_id.as_deref();
        let price = receipt.price_cents.unwrap_or(product.price_cents);
        let mut created = Vec::new();

        if product.tracked {
            for _ in 0..receipt.quantity {
                let unit = insert_unit_in(
                    &mut tx,
                    &NewUnit {
                        product_id: &product.id,
                        variant_id: variant,
                        purchase_id: Some(&receipt.purchase_id),
                        purchase_line_id: receipt.purchase_line_id.as_deref(),
                        is_primary: false,
                        cost_cents: receipt.cost_cents,
                        price_cents: Some(price),
                    },
                )
                .await?;
                fx.labels.push(LabelRequest {
                    product_name: product.name.clone(),
                    unit_code: unit.code.clone(),
                    alias: unit.alias.clone(),
                    price_cents: price,
                    received_at: unit.created_at,
                });
                created.push(unit);
            }
        } else {
            let location = receipt
                .location_id
                .clone()
                .unwrap_or_else(|| self.hooks.settings.default_location.clone());
            stock::restore_in(
                &mut tx,
                &mut fx,
                &product.id,
                variant,
                &location,
                receipt.quantity,
                Some(&receipt.purchase_id),
            )
            .await?;

            if representative_in(&mut tx, &product.id, variant).await?.is_none() {
                let unit = insert_unit_in(
                    &mut tx,
                    &NewUnit {
                        product_id: &product.id,
                        variant_id: variant,
                        purchase_id: None,
                        purchase_line_id: None,
                        is_primary: true,
                        cost_cents: receipt.cost_cents,
                        price_cents: Some(price),
                    },
                )
                .await?;
                created.push(unit);
            }
        }

        let codes: Vec<&str> = created.iter().map(|u| u.code.as_str()).collect();
        self.hooks
            .audit
            .record(
                &mut tx,
                AuditEntry::new("purchase.receive", "purchase", &receipt.purchase_id)
                    .after(serde_json::json!({
                        "product_id": product.id,
                        "variant_id": variant,
                        "quantity": receipt.quantity,
                        "units": codes,
                    })),
            )
            .await;

        for unit in &created {
            fx.batch.extend(unit.cache_keys());
        }
        fx.batch.extend([
            PRODUCTS_LIST_KEY.to_string(),
            STOCK_SUMMARY_KEY.to_string(),
            stock_key(&product.id),
        ]);

        tx.commit().await?;
        fx.release();

        info!(
            purchase_id = %receipt.purchase_id,
            product_id = %product.id,
            quantity = receipt.quantity,
            units = created.len(),
            "Purchase received"
        );
        Ok(created)
    }

    /// Removes the units of a deleted purchase that are `New` and were never
    /// sold. Everything else stays as audit trail. Returns how many went.
    pub async fn delete_purchase(&self, purchase_id: &str) -> DbResult<u64> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let candidates = sqlx::query_as::<_, Unit>(&format!(
            "{} WHERE purchase_id = ?1 AND deleted = 0 AND tag = 'new' AND ever_sold = 0 AND is_primary = 0 ORDER BY id",
            SELECT_UNIT
        ))
        .bind(purchase_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut removed = 0u64;
        for unit in &candidates {
            let result = sqlx::query(
                "UPDATE units SET deleted = 1, updated_at = ?1 WHERE id = ?2 AND tag = 'new' AND ever_sold = 0 AND deleted = 0",
            )
            .bind(Utc::now())
            .bind(unit.id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                removed += 1;
                self.hooks
                    .audit
                    .record(
                        &mut tx,
                        AuditEntry::new("unit.delete", "unit", &unit.code)
                            .before(unit.tag)
                            .correlated(Some(purchase_id)),
                    )
                    .await;
                fx.batch.extend(unit.cache_keys());
                fx.batch.add(stock_key(&unit.product_id));
            }
        }
        fx.batch.add(PRODUCTS_LIST_KEY);

        tx.commit().await?;
        fx.release();

        info!(purchase_id, removed, "Purchase units removed");
        Ok(removed)
    }

    /// Looks a unit up by code or alias.
    pub async fn resolve(&self, code: &str) -> DbResult<Unit> {
        let mut conn = self.pool.acquire().await?;
        resolve_in(&mut conn, code).await
    }

    /// Claims a unit for a cart: `New | Returned → InCart`.
    ///
    /// Of N concurrent claims on one unit exactly one wins; the others get
    /// `AlreadyClaimed`. Cart lines normally claim through the reservation
    /// coordinator, which also records the owning line.
    pub async fn try_claim(
        &self,
        code: &str,
        product_id: &str,
        variant_id: Option<&str>,
    ) -> DbResult<Unit> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);
        let unit = try_claim_in(&mut tx, &mut fx, code, product_id, variant_id, None).await?;
        tx.commit().await?;
        fx.release();
        Ok(unit)
    }

    /// `InCart → New`, or `Sold → New` once no active invoice holds the unit.
    /// Releasing a `New` unit changes nothing.
    pub async fn release(&self, code: &str) -> DbResult<Unit> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);
        let unit = release_in(&mut tx, &mut fx, code, None).await?;
        tx.commit().await?;
        fx.release();
        Ok(unit)
    }

    /// `InCart | New → Sold`.
    pub async fn settle(&self, code: &str) -> DbResult<Unit> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);
        let unit = settle_in(&mut tx, &mut fx, code, None).await?;
        tx.commit().await?;
        fx.release();
        Ok(unit)
    }

    /// Operator tag change: inspection and readmission.
    ///
    /// `Returned | Defective → New` answers `ConfirmationRequired` until
    /// called again with `confirmed = true`. Taking a sold unit back
    /// (`Sold → Unknown`) shrinks its invoice line, so it only happens through
    /// the replacement coordinator; here it answers `InvalidTransition`.
    pub async fn update_tag(&self, code: &str, to: UnitTag, confirmed: bool) -> DbResult<Unit> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);
        let unit = update_tag_in(&mut tx, &mut fx, code, to, confirmed, None).await?;
        tx.commit().await?;
        fx.release();
        Ok(unit)
    }

    /// One `New` unit of the product not in `excluding`.
    pub async fn find_available(
        &self,
        product_id: &str,
        variant_id: Option<&str>,
        excluding: &BTreeSet<String>,
    ) -> DbResult<Option<Unit>> {
        let mut conn = self.pool.acquire().await?;
        find_available_in(&mut conn, product_id, variant_id, excluding).await
    }

    /// Codes claimed by lines of currently open carts.
    pub async fn open_cart_claims(&self) -> DbResult<BTreeSet<String>> {
        let mut conn = self.pool.acquire().await?;
        open_cart_claims_in(&mut conn).await
    }

    /// All live units of a product, oldest first.
    pub async fn list_for_product(
        &self,
        product_id: &str,
        variant_id: Option<&str>,
    ) -> DbResult<Vec<Unit>> {
        let units = sqlx::query_as::<_, Unit>(&format!(
            "{} WHERE product_id = ?1 AND variant_id IS ?2 AND deleted = 0 ORDER BY id",
            SELECT_UNIT
        ))
        .bind(product_id)
        .bind(variant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(units)
    }
}

// =============================================================================
// Transaction-Scoped Operations
// =============================================================================

pub(crate) async fn find_in(conn: &mut SqliteConnection, code: &str) -> DbResult<Option<Unit>> {
    let unit = sqlx::query_as::<_, Unit>(&format!(
        "{} WHERE deleted = 0 AND (code = ?1 OR alias = ?1) ORDER BY (code = ?1) DESC LIMIT 1",
        SELECT_UNIT
    ))
    .bind(code)
    .fetch_optional(conn)
    .await?;
    Ok(unit)
}

/// Code-or-alias lookup; `NotFound` when nothing live matches.
pub(crate) async fn resolve_in(conn: &mut SqliteConnection, code: &str) -> DbResult<Unit> {
    let code = validate_code(code)?;
    find_in(conn, code).await?.ok_or_else(|| {
        CoreError::NotFound {
            code: code.to_string(),
        }
        .into()
    })
}

async fn reload_in(conn: &mut SqliteConnection, id: i64) -> DbResult<Unit> {
    let unit = sqlx::query_as::<_, Unit>(&format!("{} WHERE id = ?1", SELECT_UNIT))
        .bind(id)
        .fetch_one(conn)
        .await?;
    Ok(unit)
}

/// Invoice id of the active invoice line holding `code`, if any.
pub(crate) async fn active_invoice_for_in(
    conn: &mut SqliteConnection,
    code: &str,
) -> DbResult<Option<String>> {
    let invoice_id: Option<String> = sqlx::query_scalar(
        r#"
        SELECT il.invoice_id
        FROM invoice_lines il
        JOIN invoices i ON i.id = il.invoice_id
        WHERE il.unit_code = ?1 AND i.status = 'active'
        LIMIT 1
        "#,
    )
    .bind(code)
    .fetch_optional(conn)
    .await?;
    Ok(invoice_id)
}

/// Human-readable owner of a unit, for error messages.
pub(crate) async fn holder_in(conn: &mut SqliteConnection, unit: &Unit) -> DbResult<Option<String>> {
    match unit.tag {
        UnitTag::InCart => {
            let cart_id: Option<String> = sqlx::query_scalar(
                r#"
                SELECT cl.cart_id
                FROM cart_line_units clu
                JOIN cart_lines cl ON cl.id = clu.cart_line_id
                WHERE clu.unit_code = ?1
                "#,
            )
            .bind(&unit.code)
            .fetch_optional(conn)
            .await?;
            Ok(cart_id.map(|id| format!("cart {}", id)))
        }
        UnitTag::Sold => Ok(active_invoice_for_in(conn, &unit.code)
            .await?
            .map(|id| format!("invoice {}", id))),
        _ => Ok(None),
    }
}

/// The single write path for unit tags.
pub(crate) async fn apply_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    unit: &Unit,
    to: UnitTag,
    trigger: Trigger,
    correlation: Option<&str>,
) -> DbResult<Unit> {
    check_transition(&unit.code, unit.tag, to, trigger)?;

    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE units
        SET tag = ?1,
            updated_at = ?2,
            ever_sold = CASE WHEN ?1 = 'sold' THEN 1 ELSE ever_sold END
        WHERE id = ?3 AND tag = ?4 AND deleted = 0
        "#,
    )
    .bind(to)
    .bind(now)
    .bind(unit.id)
    .bind(unit.tag)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != 1 {
        // Someone moved the unit since it was read
        let current = reload_in(conn, unit.id).await?;
        return Err(CoreError::InvalidTransition {
            code: unit.code.clone(),
            from: current.tag,
            to,
        }
        .into());
    }

    fx.hooks
        .audit
        .record(
            conn,
            AuditEntry::new("unit.tag", "unit", &unit.code)
                .before(unit.tag)
                .after(to)
                .correlated(correlation),
        )
        .await;
    fx.batch.extend(unit.cache_keys());
    fx.batch.add(stock_key(&unit.product_id));

    debug!(code = %unit.code, from = %unit.tag, to = %to, ?trigger, "Unit transition");

    let mut updated = unit.clone();
    updated.tag = to;
    updated.updated_at = now;
    if to == UnitTag::Sold {
        updated.ever_sold = true;
    }
    Ok(updated)
}

pub(crate) async fn try_claim_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    code: &str,
    product_id: &str,
    variant_id: Option<&str>,
    correlation: Option<&str>,
) -> DbResult<Unit> {
    let unit = resolve_in(conn, code).await?;
    unit.ensure_matches(product_id, variant_id)?;
    claim_resolved_in(conn, fx, &unit, correlation).await
}

/// Claims a unit that has already been resolved and matched.
pub(crate) async fn claim_resolved_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    unit: &Unit,
    correlation: Option<&str>,
) -> DbResult<Unit> {
    if unit.is_primary || !unit.tag.is_claimable() {
        let held_by = holder_in(conn, unit).await?;
        let err = if unit.is_primary {
            CoreError::NotAvailable {
                code: unit.code.clone(),
                tag: unit.tag,
                held_by: Some("stock ledger".to_string()),
            }
        } else {
            claim_refusal(&unit.code, unit.tag, held_by)
        };
        return Err(err.into());
    }
    apply_in(conn, fx, unit, UnitTag::InCart, Trigger::Claim, correlation).await
}

/// Undoes a claim or, for reversal, a sale. `New` is left as is.
pub(crate) async fn release_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    code: &str,
    correlation: Option<&str>,
) -> DbResult<Unit> {
    let unit = resolve_in(conn, code).await?;
    match unit.tag {
        UnitTag::New => {
            debug!(code = %unit.code, "Release of a new unit, nothing to do");
            Ok(unit)
        }
        UnitTag::InCart => {
            apply_in(conn, fx, &unit, UnitTag::New, Trigger::Release, correlation).await
        }
        UnitTag::Sold => {
            if active_invoice_for_in(conn, &unit.code).await?.is_some() {
                return Err(CoreError::InvalidTransition {
                    code: unit.code.clone(),
                    from: unit.tag,
                    to: UnitTag::New,
                }
                .into());
            }
            apply_in(conn, fx, &unit, UnitTag::New, Trigger::Reversal, correlation).await
        }
        from => Err(CoreError::InvalidTransition {
            code: unit.code.clone(),
            from,
            to: UnitTag::New,
        }
        .into()),
    }
}

pub(crate) async fn settle_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    code: &str,
    correlation: Option<&str>,
) -> DbResult<Unit> {
    let unit = resolve_in(conn, code).await?;
    apply_in(conn, fx, &unit, UnitTag::Sold, Trigger::Settle, correlation).await
}

pub(crate) async fn update_tag_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    code: &str,
    to: UnitTag,
    confirmed: bool,
    correlation: Option<&str>,
) -> DbResult<Unit> {
    let unit = resolve_in(conn, code).await?;
    let trigger = check_operator_update(&unit.code, unit.tag, to, confirmed)?;

    if trigger == Trigger::ReplacementReturn {
        // The invoice line would keep pointing at a unit that is no longer sold
        return Err(CoreError::InvalidTransition {
            code: unit.code.clone(),
            from: unit.tag,
            to,
        }
        .into());
    }

    apply_in(conn, fx, &unit, to, trigger, correlation).await
}

/// `Sold → Unknown` for a unit sold on `invoice_id`. The caller reduces the
/// invoice line in the same transaction.
pub(crate) async fn take_back_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    code: &str,
    invoice_id: &str,
) -> DbResult<Unit> {
    let unit = resolve_in(conn, code).await?;
    let sold_here = unit.tag == UnitTag::Sold
        && active_invoice_for_in(conn, &unit.code).await?.as_deref() == Some(invoice_id);
    if !sold_here {
        return Err(CoreError::InvalidTransition {
            code: unit.code.clone(),
            from: unit.tag,
            to: UnitTag::Unknown,
        }
        .into());
    }

    apply_in(
        conn,
        fx,
        &unit,
        UnitTag::Unknown,
        Trigger::ReplacementReturn,
        Some(invoice_id),
    )
    .await
}

pub(crate) async fn find_available_in(
    conn: &mut SqliteConnection,
    product_id: &str,
    variant_id: Option<&str>,
    excluding: &BTreeSet<String>,
) -> DbResult<Option<Unit>> {
    let candidates = sqlx::query_as::<_, Unit>(&format!(
        r#"{}
        WHERE product_id = ?1 AND variant_id IS ?2
          AND deleted = 0 AND is_primary = 0 AND tag = 'new'
        ORDER BY id"#,
        SELECT_UNIT
    ))
    .bind(product_id)
    .bind(variant_id)
    .fetch_all(conn)
    .await?;

    Ok(candidates
        .into_iter()
        .find(|u| !excluding.contains(&u.code)))
}

pub(crate) async fn open_cart_claims_in(conn: &mut SqliteConnection) -> DbResult<BTreeSet<String>> {
    let codes: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT clu.unit_code
        FROM cart_line_units clu
        JOIN cart_lines cl ON cl.id = clu.cart_line_id
        JOIN carts c ON c.id = cl.cart_id
        WHERE c.status = 'open'
        "#,
    )
    .fetch_all(conn)
    .await?;
    Ok(codes.into_iter().collect())
}

/// Representative unit of a non-tracked product.
pub(crate) async fn representative_in(
    conn: &mut SqliteConnection,
    product_id: &str,
    variant_id: Option<&str>,
) -> DbResult<Option<Unit>> {
    let unit = sqlx::query_as::<_, Unit>(&format!(
        "{} WHERE product_id = ?1 AND variant_id IS ?2 AND is_primary = 1 AND deleted = 0 LIMIT 1",
        SELECT_UNIT
    ))
    .bind(product_id)
    .bind(variant_id)
    .fetch_optional(conn)
    .await?;
    Ok(unit)
}

/// Looks units up by code and returns them in ascending row id order, the
/// lock order for every bulk operation.
pub(crate) async fn resolve_ordered_in(
    conn: &mut SqliteConnection,
    codes: &[String],
) -> DbResult<Vec<Unit>> {
    let mut units = Vec::with_capacity(codes.len());
    for code in codes {
        units.push(resolve_in(conn, code).await?);
    }
    units.sort_by_key(|u| u.id);
    Ok(units)
}

// =============================================================================
// Unit Creation
// =============================================================================

struct NewUnit<'a> {
    product_id: &'a str,
    variant_id: Option<&'a str>,
    purchase_id: Option<&'a str>,
    purchase_line_id: Option<&'a str>,
    is_primary: bool,
    cost_cents: Option<i64>,
    price_cents: Option<i64>,
}

async fn insert_unit_in(conn: &mut SqliteConnection, new: &NewUnit<'_>) -> DbResult<Unit> {
    let (code, alias) = unused_code_pair_in(conn).await?;
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO units (
            code, alias, tag, product_id, variant_id, purchase_id,
            purchase_line_id, is_primary, cost_cents, price_cents,
            ever_sold, deleted, created_at, updated_at
        ) VALUES (?1, ?2, 'new', ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?10)
        "#,
    )
    .bind(&code)
    .bind(&alias)
    .bind(new.product_id)
    .bind(new.variant_id)
    .bind(new.purchase_id)
    .bind(new.purchase_line_id)
    .bind(new.is_primary)
    .bind(new.cost_cents)
    .bind(new.price_cents)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(Unit {
        id: result.last_insert_rowid(),
        code,
        alias: Some(alias),
        tag: UnitTag::New,
        product_id: new.product_id.to_string(),
        variant_id: new.variant_id.map(str::to_string),
        purchase_id: new.purchase_id.map(str::to_string),
        purchase_line_id: new.purchase_line_id.map(str::to_string),
        is_primary: new.is_primary,
        cost_cents: new.cost_cents,
        price_cents: new.price_cents,
        ever_sold: false,
        created_at: now,
        updated_at: now,
    })
}

async fn unused_code_pair_in(conn: &mut SqliteConnection) -> DbResult<(String, String)> {
    for _ in 0..CODE_ATTEMPTS {
        let (code, alias) = generate_code_pair();
        let taken: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM units WHERE deleted = 0 AND (code IN (?1, ?2) OR alias IN (?1, ?2))",
        )
        .bind(&code)
        .bind(&alias)
        .fetch_one(&mut *conn)
        .await?;
        if taken == 0 {
            return Ok((code, alias));
        }
    }
    Err(DbError::Internal(format!(
        "no free unit code after {} attempts",
        CODE_ATTEMPTS
    )))
}

/// In-store EAN-13 (prefix 2) and a short alias, both random.
fn generate_code_pair() -> (String, String) {
    let bits = u128::from_le_bytes(*Uuid::new_v4().as_bytes());

    let body = format!("2{:011}", (bits as u64) % 100_000_000_000);
    let check = ean13_check_digit(&body).unwrap_or(0);
    let code = format!("{}{}", body, check);

    let mut rest = (bits >> 64) as u64;
    let alias: String = (0..UNIT_ALIAS_LEN)
        .map(|_| {
            let c = ALIAS_ALPHABET[(rest % ALIAS_ALPHABET.len() as u64) as usize];
            rest /= ALIAS_ALPHABET.len() as u64;
            c as char
        })
        .collect();

    (code, alias)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tillkeeper_core::validation::is_valid_ean13;
    use tillkeeper_core::{PaymentPlan, UNIT_CODE_LEN};

    use crate::coordinator::AddToCart;
    use crate::pool::{Database, DbConfig};
    use crate::repository::product::NewProduct;

    async fn setup() -> (Database, Unit) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.products()
            .insert(NewProduct::tracked("Leather Belt", 3500).with_id("belt"))
            .await
            .unwrap();
        let units = db.units().receive(Receipt::new("po-1", "belt", 1)).await.unwrap();
        (db, units.into_iter().next().unwrap())
    }

    #[test]
    fn test_generated_codes() {
        for _ in 0..50 {
            let (code, alias) = generate_code_pair();
            assert_eq!(code.len(), UNIT_CODE_LEN);
            assert!(is_valid_ean13(&code));
            assert_eq!(alias.len(), UNIT_ALIAS_LEN);
            assert!(alias.bytes().all(|b| ALIAS_ALPHABET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn test_alias_resolves_to_same_unit() {
        let (db, unit) = setup().await;
        let alias = unit.alias.clone().unwrap();
        assert_eq!(db.units().resolve(&alias).await.unwrap().id, unit.id);
        assert_eq!(db.units().resolve(&unit.code).await.unwrap().id, unit.id);
        assert!(matches!(
            db.units().resolve("2999999999999").await,
            Err(DbError::Domain(CoreError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_claim_then_second_claim_is_already_claimed() {
        let (db, unit) = setup().await;
        let claimed = db.units().try_claim(&unit.code, "belt", None).await.unwrap();
        assert_eq!(claimed.tag, UnitTag::InCart);

        let again = db.units().try_claim(&unit.code, "belt", None).await;
        assert!(matches!(again, Err(DbError::Domain(CoreError::AlreadyClaimed { .. }))));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (db, unit) = setup().await;
        db.units().try_claim(&unit.code, "belt", None).await.unwrap();

        let released = db.units().release(&unit.code).await.unwrap();
        assert_eq!(released.tag, UnitTag::New);
        let before = db.units().resolve(&unit.code).await.unwrap();

        let again = db.units().release(&unit.code).await.unwrap();
        assert_eq!(again, before);
        assert_eq!(db.units().resolve(&unit.code).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_sold_to_unknown_needs_active_invoice() {
        let (db, unit) = setup().await;
        db.units().settle(&unit.code).await.unwrap();

        // Sold directly, no invoice line references it
        let result = db.units().update_tag(&unit.code, UnitTag::Unknown, false).await;
        assert!(matches!(result, Err(DbError::Domain(CoreError::InvalidTransition { .. }))));
    }

    #[tokio::test]
    async fn test_invoiced_unit_is_not_taken_back_by_operator() {
        let (db, unit) = setup().await;
        let cart = db.carts().open_cart(None).await.unwrap();
        db.carts()
            .add_to_cart(&cart.id, AddToCart::scan("belt", &unit.code))
            .await
            .unwrap();
        let view = db
            .invoices()
            .settle_cart(&cart.id, PaymentPlan::single("cash", 3500))
            .await
            .unwrap();

        let result = db.units().update_tag(&unit.code, UnitTag::Unknown, true).await;
        assert!(matches!(result, Err(DbError::Domain(CoreError::InvalidTransition { .. }))));
        assert_eq!(db.units().resolve(&unit.code).await.unwrap().tag, UnitTag::Sold);

        let invoice = db.invoices().get_invoice(&view.invoice.id).await.unwrap();
        assert_eq!(invoice.lines[0].unit_code.as_deref(), Some(unit.code.as_str()));
    }

    #[tokio::test]
    async fn test_delete_purchase_spares_sold_units() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.products()
            .insert(NewProduct::tracked("Cap", 1500).with_id("cap"))
            .await
            .unwrap();
        let units = db.units().receive(Receipt::new("po-9", "cap", 3)).await.unwrap();
        db.units().settle(&units[0].code).await.unwrap();
        db.units().release(&units[0].code).await.unwrap();

        // units[0] went back to New but was sold once
        assert_eq!(db.units().delete_purchase("po-9").await.unwrap(), 2);
        assert!(db.units().resolve(&units[0].code).await.is_ok());
        assert!(db.units().resolve(&units[1].code).await.is_err());
    }

    #[tokio::test]
    async fn test_find_available_skips_excluded() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.products()
            .insert(NewProduct::tracked("Socks", 900).with_id("socks"))
            .await
            .unwrap();
        let units = db.units().receive(Receipt::new("po-2", "socks", 2)).await.unwrap();

        let mut excluding = BTreeSet::new();
        excluding.insert(units[0].code.clone());
        let found = db.units().find_available("socks", None, &excluding).await.unwrap();
        assert_eq!(found.unwrap().code, units[1].code);

        excluding.insert(units[1].code.clone());
        assert!(db
            .units()
            .find_available("socks", None, &excluding)
            .await
            .unwrap()
            .is_none());
    }
}
