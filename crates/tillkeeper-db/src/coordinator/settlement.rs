//! # Settlement Coordinator
//!
//! Invoice side of a sale: turns an open cart into an invoice and, when an
//! invoice is voided or deleted, optionally puts everything back.
//!
//! ## Settlement and Reversal
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  settle_cart(cart, plan)                                               │
//! │     cart: open → settled                    (CAS, retry-safe)          │
//! │     tracked line   → one invoice line per unit, unit InCart → Sold     │
//! │     ledger line    → one invoice line, no second ledger decrement      │
//! │     totals, payments                                                    │
//! │                                                                         │
//! │  void_or_delete(invoice, mode, restore_stock)                          │
//! │     invoice: active → void | deleted        (CAS, retry-safe)          │
//! │     restore_stock:                                                      │
//! │        units  Sold → New                   (reversal)                  │
//! │        ledger += billable quantity at the invoice's location           │
//! │        invoice lines removed                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Settling a settled cart returns the existing invoice; voiding a void
//! invoice returns it unchanged.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeSet;
use tracing::{debug, info};
use uuid::Uuid;

use tillkeeper_core::validation::validate_amount_cents;
use tillkeeper_core::{
    CartStatus, CoreError, Invoice, InvoiceLine, InvoiceStatus, InvoiceTotals, InvoiceView, Money,
    Payment, PaymentKind, PaymentPlan, SettlementMode, Trigger, UnitTag, ValidationError,
};

use crate::audit::AuditEntry;
use crate::cache::{cart_key, invoice_key, PRODUCTS_LIST_KEY};
use crate::coordinator::reservation;
use crate::effects::Effects;
use crate::error::DbResult;
use crate::pool::{begin_write, Hooks};
use crate::repository::{product, stock, unit};

#[derive(Debug, Clone)]
pub struct SettlementCoordinator {
    pool: SqlitePool,
    hooks: Hooks,
}

impl SettlementCoordinator {
    pub fn new(pool: SqlitePool, hooks: Hooks) -> Self {
        SettlementCoordinator { pool, hooks }
    }

    /// Converts an open cart into an active invoice.
    pub async fn settle_cart(&self, cart_id: &str, plan: PaymentPlan) -> DbResult<InvoiceView> {
        validate_amount_cents("discount", plan.discount_cents)?;
        for tender in &plan.tenders {
            validate_amount_cents("tender", tender.amount_cents)?;
        }

        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let closed = sqlx::query(
            "UPDATE carts SET status = 'settled', updated_at = ?1 WHERE id = ?2 AND status = 'open'",
        )
        .bind(Utc::now())
        .bind(cart_id)
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() == 0 {
            let cart = reservation::load_cart_in(&mut tx, cart_id).await?;
            if cart.status == CartStatus::Settled {
                if let Some(invoice_id) = invoice_for_cart_in(&mut tx, cart_id).await? {
                    debug!(cart_id, invoice_id = %invoice_id, "Cart already settled");
                    return load_view_in(&mut tx, &invoice_id).await;
                }
            }
            return Err(CoreError::CartNotOpen {
                cart_id: cart_id.to_string(),
                status: cart.status.to_string(),
            }
            .into());
        }

        let cart = reservation::load_cart_in(&mut tx, cart_id).await?;
        let cart_lines = reservation::lines_in(&mut tx, cart_id).await?;
        if cart_lines.is_empty() {
            return Err(ValidationError::Required {
                field: "cart lines".to_string(),
            }
            .into());
        }

        let now = Utc::now();
        let invoice_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, cart_id, location_id, status, subtotal_cents, discount_cents,
                tax_cents, total_cents, paid_cents, due_cents, created_at, updated_at
            ) VALUES (?1, ?2, ?3, 'active', 0, 0, 0, 0, 0, 0, ?4, ?4)
            "#,
        )
        .bind(&invoice_id)
        .bind(&cart.id)
        .bind(&cart.location_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut lines = Vec::new();
        for cart_line in &cart_lines {
            let product = product::get_in(&mut tx, &cart_line.product_id).await?;
            let variant = cart_line.variant_id.as_deref();

            if cart_line.tracked {
                for sold in unit::resolve_ordered_in(&mut tx, &cart_line.claimed_units).await? {
                    unit::settle_in(&mut tx, &mut fx, &sold.code, Some(&invoice_id)).await?;
                    let line = new_line(
                        &invoice_id,
                        &product.id,
                        variant,
                        Some(sold.code),
                        1,
                        cart_line.unit_price_cents,
                        product.tax_rate_bps,
                    );
                    insert_line_in(&mut tx, &line).await?;
                    lines.push(line);
                }
            } else {
                // Ledger was decremented when the line was added
                mark_representative_sold_in(&mut tx, &mut fx, &product.id, variant, &invoice_id)
                    .await?;
                let line = new_line(
                    &invoice_id,
                    &product.id,
                    variant,
                    None,
                    cart_line.quantity,
                    cart_line.unit_price_cents,
                    product.tax_rate_bps,
                );
                insert_line_in(&mut tx, &line).await?;
                lines.push(line);
            }
        }
        reservation::delete_cart_lines_in(&mut tx, cart_id).await?;

        let totals = InvoiceTotals::compute(&lines, Money::from_cents(plan.discount_cents));
        let tendered = plan.tendered();
        // Change handed back at the till is never part of what was paid
        let paid = tendered.min(totals.total);
        let change = tendered - paid;
        store_totals_in(&mut tx, &invoice_id, &totals, paid).await?;

        for tender in plan.tenders.iter().filter(|t| t.amount_cents > 0) {
            insert_payment_in(
                &mut tx,
                &invoice_id,
                PaymentKind::Payment,
                &tender.method,
                tender.amount_cents,
            )
            .await?;
        }

        self.hooks
            .audit
            .record(
                &mut tx,
                AuditEntry::new("invoice.settle", "invoice", &invoice_id)
                    .after(serde_json::json!({
                        "lines": lines.len(),
                        "total_cents": totals.total.cents(),
                        "paid_cents": paid.cents(),
                        "change_cents": change.cents(),
                    }))
                    .correlated(Some(cart_id)),
            )
            .await;
        fx.batch.extend([cart_key(cart_id), invoice_key(&invoice_id)]);
        fx.batch.add(PRODUCTS_LIST_KEY);

        let view = load_view_in(&mut tx, &invoice_id).await?;
        tx.commit().await?;
        fx.release();

        info!(
            cart_id,
            invoice_id = %invoice_id,
            lines = view.lines.len(),
            total = %totals.total,
            due = view.invoice.due_cents,
            change = %change,
            "Cart settled"
        );
        Ok(view)
    }

    /// Takes an invoice out of circulation.
    ///
    /// With `restore_stock` every unit goes back to `New` and every ledger
    /// quantity returns to the invoice's location, exactly mirroring what
    /// settlement took.
    pub async fn void_or_delete(
        &self,
        invoice_id: &str,
        mode: SettlementMode,
        restore_stock: bool,
    ) -> DbResult<Invoice> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let invoice = load_invoice_in(&mut tx, invoice_id).await?;
        if !invoice.status.is_active() {
            debug!(invoice_id, status = %invoice.status, "Invoice already closed");
            return Ok(invoice);
        }

        let target = mode.target_status();
        sqlx::query("UPDATE invoices SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'active'")
            .bind(target)
            .bind(Utc::now())
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;

        if restore_stock {
            let lines = lines_in(&mut tx, invoice_id).await?;

            let codes: Vec<String> = lines.iter().filter_map(|l| l.unit_code.clone()).collect();
            for sold in unit::resolve_ordered_in(&mut tx, &codes).await? {
                unit::release_in(&mut tx, &mut fx, &sold.code, Some(invoice_id)).await?;
            }

            let mut ledger_products = BTreeSet::new();
            for line in lines.iter().filter(|l| !l.is_tracked()) {
                stock::restore_in(
                    &mut tx,
                    &mut fx,
                    &line.product_id,
                    line.variant_id.as_deref(),
                    &invoice.location_id,
                    line.billable_quantity(),
                    Some(invoice_id),
                )
                .await?;
                ledger_products.insert((line.product_id.clone(), line.variant_id.clone()));
            }
            for (product_id, variant_id) in &ledger_products {
                restore_representative_in(&mut tx, &mut fx, product_id, variant_id.as_deref(), invoice_id)
                    .await?;
            }

            sqlx::query("DELETE FROM invoice_lines WHERE invoice_id = ?1")
                .bind(invoice_id)
                .execute(&mut *tx)
                .await?;
        }

        self.hooks
            .audit
            .record(
                &mut tx,
                AuditEntry::new("invoice.close", "invoice", invoice_id)
                    .before(InvoiceStatus::Active)
                    .after(serde_json::json!({ "status": target, "restore_stock": restore_stock })),
            )
            .await;
        fx.batch.add(invoice_key(invoice_id));

        let closed = load_invoice_in(&mut tx, invoice_id).await?;
        tx.commit().await?;
        fx.release();

        info!(invoice_id, status = %target, restore_stock, "Invoice closed");
        Ok(closed)
    }

    pub async fn get_invoice(&self, invoice_id: &str) -> DbResult<InvoiceView> {
        let mut conn = self.pool.acquire().await?;
        load_view_in(&mut conn, invoice_id).await
    }

    /// The invoice a cart was settled into, if any.
    pub async fn invoice_for_cart(&self, cart_id: &str) -> DbResult<Option<InvoiceView>> {
        let mut conn = self.pool.acquire().await?;
        match invoice_for_cart_in(&mut conn, cart_id).await? {
            Some(invoice_id) => Ok(Some(load_view_in(&mut conn, &invoice_id).await?)),
            None => Ok(None),
        }
    }

    /// Payments and refunds, oldest first.
    pub async fn get_payments(&self, invoice_id: &str) -> DbResult<Vec<Payment>> {
        let mut conn = self.pool.acquire().await?;
        load_invoice_in(&mut conn, invoice_id).await?;
        payments_in(&mut conn, invoice_id).await
    }
}

// =============================================================================
// Representative Units
// =============================================================================

/// First sale of a non-tracked product flips its representative to Sold.
async fn mark_representative_sold_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    product_id: &str,
    variant_id: Option<&str>,
    invoice_id: &str,
) -> DbResult<()> {
    if let Some(rep) = unit::representative_in(conn, product_id, variant_id).await? {
        if rep.tag == UnitTag::New {
            unit::apply_in(conn, fx, &rep, UnitTag::Sold, Trigger::Settle, Some(invoice_id)).await?;
        }
    }
    Ok(())
}

/// Puts the representative back to New once no active invoice sells the
/// product any more.
pub(crate) async fn restore_representative_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    product_id: &str,
    variant_id: Option<&str>,
    invoice_id: &str,
) -> DbResult<()> {
    let still_sold: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM invoice_lines il
        JOIN invoices i ON i.id = il.invoice_id
        WHERE il.product_id = ?1 AND il.variant_id IS ?2
          AND il.unit_code IS NULL AND i.status = 'active'
        "#,
    )
    .bind(product_id)
    .bind(variant_id)
    .fetch_one(&mut *conn)
    .await?;

    if still_sold > 0 {
        return Ok(());
    }
    if let Some(rep) = unit::representative_in(conn, product_id, variant_id).await? {
        if rep.tag == UnitTag::Sold {
            unit::apply_in(conn, fx, &rep, UnitTag::New, Trigger::Reversal, Some(invoice_id)).await?;
        }
    }
    Ok(())
}

// =============================================================================
// Rows (shared with replacement)
// =============================================================================

const SELECT_INVOICE: &str = r#"
    SELECT id, cart_id, location_id, status, subtotal_cents, discount_cents,
           tax_cents, total_cents, paid_cents, due_cents, created_at, updated_at
    FROM invoices
"#;

const SELECT_LINE: &str = r#"
    SELECT id, invoice_id, product_id, variant_id, unit_code, quantity,
           replaced_quantity, unit_price_cents, tax_rate_bps, created_at
    FROM invoice_lines
"#;

fn new_line(
    invoice_id: &str,
    product_id: &str,
    variant_id: Option<&str>,
    unit_code: Option<String>,
    quantity: i64,
    unit_price_cents: i64,
    tax_rate_bps: i64,
) -> InvoiceLine {
    InvoiceLine {
        id: Uuid::new_v4().to_string(),
        invoice_id: invoice_id.to_string(),
        product_id: product_id.to_string(),
        variant_id: variant_id.map(str::to_string),
        unit_code,
        quantity,
        replaced_quantity: 0,
        unit_price_cents,
        tax_rate_bps,
        created_at: Utc::now(),
    }
}

async fn insert_line_in(conn: &mut SqliteConnection, line: &InvoiceLine) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO invoice_lines (
            id, invoice_id, product_id, variant_id, unit_code, quantity,
            replaced_quantity, unit_price_cents, tax_rate_bps, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&line.id)
    .bind(&line.invoice_id)
    .bind(&line.product_id)
    .bind(&line.variant_id)
    .bind(&line.unit_code)
    .bind(line.quantity)
    .bind(line.replaced_quantity)
    .bind(line.unit_price_cents)
    .bind(line.tax_rate_bps)
    .bind(line.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Writes computed totals plus `paid`/`due` onto the invoice row.
pub(crate) async fn store_totals_in(
    conn: &mut SqliteConnection,
    invoice_id: &str,
    totals: &InvoiceTotals,
    paid: Money,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE invoices
        SET subtotal_cents = ?1, discount_cents = ?2, tax_cents = ?3,
            total_cents = ?4, paid_cents = ?5, due_cents = ?6, updated_at = ?7
        WHERE id = ?8
        "#,
    )
    .bind(totals.subtotal.cents())
    .bind(totals.discount.cents())
    .bind(totals.tax.cents())
    .bind(totals.total.cents())
    .bind(paid.cents())
    .bind(totals.due(paid).cents())
    .bind(Utc::now())
    .bind(invoice_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn insert_payment_in(
    conn: &mut SqliteConnection,
    invoice_id: &str,
    kind: PaymentKind,
    method: &str,
    amount_cents: i64,
) -> DbResult<Payment> {
    let payment = Payment {
        id: Uuid::new_v4().to_string(),
        invoice_id: invoice_id.to_string(),
        kind,
        method: method.to_string(),
        amount_cents,
        created_at: Utc::now(),
    };
    sqlx::query(
        r#"
        INSERT INTO payments (id, invoice_id, kind, method, amount_cents, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&payment.id)
    .bind(&payment.invoice_id)
    .bind(payment.kind)
    .bind(&payment.method)
    .bind(payment.amount_cents)
    .bind(payment.created_at)
    .execute(conn)
    .await?;
    Ok(payment)
}

pub(crate) async fn load_invoice_in(conn: &mut SqliteConnection, invoice_id: &str) -> DbResult<Invoice> {
    sqlx::query_as::<_, Invoice>(&format!("{} WHERE id = ?1", SELECT_INVOICE))
        .bind(invoice_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| CoreError::record_not_found("Invoice", invoice_id).into())
}

async fn invoice_for_cart_in(conn: &mut SqliteConnection, cart_id: &str) -> DbResult<Option<String>> {
    let id: Option<String> = sqlx::query_scalar("SELECT id FROM invoices WHERE cart_id = ?1")
        .bind(cart_id)
        .fetch_optional(conn)
        .await?;
    Ok(id)
}

pub(crate) async fn lines_in(conn: &mut SqliteConnection, invoice_id: &str) -> DbResult<Vec<InvoiceLine>> {
    let lines = sqlx::query_as::<_, InvoiceLine>(&format!(
        "{} WHERE invoice_id = ?1 ORDER BY created_at, id",
        SELECT_LINE
    ))
    .bind(invoice_id)
    .fetch_all(conn)
    .await?;
    Ok(lines)
}

pub(crate) async fn load_line_in(conn: &mut SqliteConnection, line_id: &str) -> DbResult<InvoiceLine> {
    sqlx::query_as::<_, InvoiceLine>(&format!("{} WHERE id = ?1", SELECT_LINE))
        .bind(line_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| CoreError::record_not_found("InvoiceLine", line_id).into())
}

pub(crate) async fn payments_in(conn: &mut SqliteConnection, invoice_id: &str) -> DbResult<Vec<Payment>> {
    let payments = sqlx::query_as::<_, Payment>(
        r#"
        SELECT id, invoice_id, kind, method, amount_cents, created_at
        FROM payments
        WHERE invoice_id = ?1
        ORDER BY created_at, id
        "#,
    )
    .bind(invoice_id)
    .fetch_all(conn)
    .await?;
    Ok(payments)
}

pub(crate) async fn load_view_in(conn: &mut SqliteConnection, invoice_id: &str) -> DbResult<InvoiceView> {
    let invoice = load_invoice_in(conn, invoice_id).await?;
    let lines = lines_in(conn, invoice_id).await?;
    let payments = payments_in(conn, invoice_id).await?;
    Ok(InvoiceView {
        invoice,
        lines,
        payments,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::AddToCart;
    use crate::error::DbError;
    use crate::pool::{Database, DbConfig};
    use crate::repository::{NewProduct, Receipt};

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.products()
            .insert(NewProduct::tracked("Wool Scarf", 2500).with_id("scarf").tax_bps(1000))
            .await
            .unwrap();
        db.products()
            .insert(NewProduct::untracked("Ribbon", 100).with_id("ribbon"))
            .await
            .unwrap();
        db.units().receive(Receipt::new("po-1", "scarf", 2)).await.unwrap();
        db.units().receive(Receipt::new("po-1", "ribbon", 20)).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_settle_splits_tracked_lines_per_unit() {
        let db = setup().await;
        let cart = db.carts().open_cart(None).await.unwrap();
        db.carts().add_to_cart(&cart.id, AddToCart::new("scarf", 2)).await.unwrap();
        db.carts().add_to_cart(&cart.id, AddToCart::new("ribbon", 5)).await.unwrap();

        let view = db
            .invoices()
            .settle_cart(&cart.id, PaymentPlan::single("cash", 6000))
            .await
            .unwrap();

        assert_eq!(view.lines.len(), 3);
        assert_eq!(view.lines.iter().filter(|l| l.is_tracked()).count(), 2);
        // 2 × 25.00 + 10% tax, plus 5 × 1.00 untaxed
        assert_eq!(view.invoice.subtotal_cents, 5500);
        assert_eq!(view.invoice.tax_cents, 500);
        assert_eq!(view.invoice.total_cents, 6000);
        assert_eq!(view.invoice.due_cents, 0);
        assert_eq!(view.payments.len(), 1);

        for line in view.lines.iter().filter(|l| l.is_tracked()) {
            let code = line.unit_code.as_deref().unwrap();
            assert_eq!(db.units().resolve(code).await.unwrap().tag, UnitTag::Sold);
        }
        // Settlement does not touch the ledger again
        assert_eq!(db.stock().available("ribbon", None).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_over_tender_pays_total_only() {
        let db = setup().await;
        let cart = db.carts().open_cart(None).await.unwrap();
        db.carts().add_to_cart(&cart.id, AddToCart::new("ribbon", 3)).await.unwrap();

        let view = db
            .invoices()
            .settle_cart(&cart.id, PaymentPlan::single("cash", 500))
            .await
            .unwrap();
        assert_eq!(view.invoice.total_cents, 300);
        assert_eq!(view.invoice.paid_cents, 300);
        assert_eq!(view.invoice.due_cents, 0);
        // The tender itself is kept as handed over
        assert_eq!(view.payments[0].amount_cents, 500);
    }

    #[tokio::test]
    async fn test_settle_twice_returns_same_invoice() {
        let db = setup().await;
        let cart = db.carts().open_cart(None).await.unwrap();
        db.carts().add_to_cart(&cart.id, AddToCart::new("ribbon", 3)).await.unwrap();

        let first = db.invoices().settle_cart(&cart.id, PaymentPlan::default()).await.unwrap();
        let second = db.invoices().settle_cart(&cart.id, PaymentPlan::default()).await.unwrap();

        assert_eq!(first.invoice.id, second.invoice.id);
        assert_eq!(second.lines.len(), 1);
        assert_eq!(db.stock().available("ribbon", None).await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_empty_cart_cannot_settle() {
        let db = setup().await;
        let cart = db.carts().open_cart(None).await.unwrap();
        let err = db
            .invoices()
            .settle_cart(&cart.id, PaymentPlan::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Domain(CoreError::Validation(_))));
        // Status change rolled back with the failure
        assert_eq!(db.carts().get_cart(&cart.id).await.unwrap().cart.status, CartStatus::Open);
    }

    #[tokio::test]
    async fn test_void_without_restore_keeps_units_sold() {
        let db = setup().await;
        let cart = db.carts().open_cart(None).await.unwrap();
        let line = db.carts().add_to_cart(&cart.id, AddToCart::new("scarf", 1)).await.unwrap();
        let view = db.invoices().settle_cart(&cart.id, PaymentPlan::default()).await.unwrap();

        let closed = db
            .invoices()
            .void_or_delete(&view.invoice.id, SettlementMode::Void, false)
            .await
            .unwrap();
        assert_eq!(closed.status, InvoiceStatus::Void);

        let unit = db.units().resolve(&line.claimed_units[0]).await.unwrap();
        assert_eq!(unit.tag, UnitTag::Sold);
    }

    #[tokio::test]
    async fn test_representative_follows_ledger_sales() {
        let db = setup().await;
        let rep = |db: Database| async move {
            db.units()
                .list_for_product("ribbon", None)
                .await
                .unwrap()
                .into_iter()
                .find(|u| u.is_primary)
                .unwrap()
        };
        assert_eq!(rep(db.clone()).await.tag, UnitTag::New);

        let cart = db.carts().open_cart(None).await.unwrap();
        db.carts().add_to_cart(&cart.id, AddToCart::new("ribbon", 2)).await.unwrap();
        let view = db.invoices().settle_cart(&cart.id, PaymentPlan::default()).await.unwrap();
        assert_eq!(rep(db.clone()).await.tag, UnitTag::Sold);

        db.invoices()
            .void_or_delete(&view.invoice.id, SettlementMode::Delete, true)
            .await
            .unwrap();
        assert_eq!(rep(db.clone()).await.tag, UnitTag::New);
        assert_eq!(db.stock().available("ribbon", None).await.unwrap(), 20);
    }
}
