//! # Replacement / Return Coordinator
//!
//! Post-sale compensation. Sold units come back through `Unknown`, may be
//! swapped for another unit, and the invoice is re-totalled with any excess
//! payment refunded as an explicit refund record.
//!
//! ```text
//! mark_returned(line, qty, outcome)
//!     unit  Sold → Unknown [→ Returned | Defective]
//!     or ledger += qty (non-tracked, Returned outcome only)
//!     line.replaced_quantity += qty, line removed when nothing is billed
//!     reconcile: new total < paid  ⇒  refund payment, paid := total
//!
//! replace_unit(line, new_code)
//!     claim new (New | Returned → InCart → Sold)      fails ⇒ nothing moved
//!     old  Sold → Unknown [→ outcome]
//!     line.unit_code := new
//! ```
//!
//! Everything for one call happens in one transaction.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use tillkeeper_core::{
    CoreError, Invoice, InvoiceLine, InvoiceTotals, InvoiceView, Money, Payment, PaymentKind,
    ReturnOutcome, ReturnRequest, UnitTag, ValidationError,
};

use crate::audit::AuditEntry;
use crate::cache::invoice_key;
use crate::coordinator::settlement;
use crate::effects::Effects;
use crate::error::{DbError, DbResult};
use crate::pool::{begin_write, Hooks};
use crate::repository::{stock, unit};

/// Tender used for refunds when the invoice has no payment to mirror.
const FALLBACK_REFUND_METHOD: &str = "cash";

#[derive(Debug, Clone)]
pub struct ReplacementCoordinator {
    pool: SqlitePool,
    hooks: Hooks,
}

impl ReplacementCoordinator {
    pub fn new(pool: SqlitePool, hooks: Hooks) -> Self {
        ReplacementCoordinator { pool, hooks }
    }

    /// Takes `qty` items of an invoice line back.
    pub async fn mark_returned(
        &self,
        line_id: &str,
        qty: i64,
        outcome: ReturnOutcome,
    ) -> DbResult<InvoiceView> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let line = settlement::load_line_in(&mut tx, line_id).await?;
        let invoice = settlement::load_invoice_in(&mut tx, &line.invoice_id).await?;

        mark_returned_in(&mut tx, &mut fx, &invoice, &line, qty, outcome).await?;
        let refund = reconcile_in(&mut tx, &invoice.id).await?;
        fx.batch.add(invoice_key(&invoice.id));

        let view = settlement::load_view_in(&mut tx, &invoice.id).await?;
        tx.commit().await?;
        fx.release();

        info!(
            invoice_id = %invoice.id,
            line_id,
            qty,
            ?outcome,
            refund_cents = refund.as_ref().map(|p| p.amount_cents).unwrap_or(0),
            "Return recorded"
        );
        Ok(view)
    }

    /// Swaps the unit on a tracked invoice line for `new_code`.
    ///
    /// The new unit is claimed first; if that fails the old unit is
    /// untouched. `old_outcome` is where the old unit ends up.
    pub async fn replace_unit(
        &self,
        line_id: &str,
        new_code: &str,
        old_outcome: ReturnOutcome,
    ) -> DbResult<InvoiceLine> {
        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let line = settlement::load_line_in(&mut tx, line_id).await?;
        let invoice = settlement::load_invoice_in(&mut tx, &line.invoice_id).await?;
        ensure_active(&invoice, &line)?;

        let Some(old_code) = line.unit_code.clone() else {
            return Err(not_eligible(&line, "line is not tied to a unit"));
        };
        let old = unit::resolve_in(&mut tx, &old_code).await?;
        if old.tag != UnitTag::Sold {
            return Err(not_eligible(&line, format!("unit {} is {}", old.code, old.tag)));
        }

        let new = unit::resolve_in(&mut tx, new_code).await?;
        new.ensure_matches(&line.product_id, line.variant_id.as_deref())?;
        let claimed = unit::claim_resolved_in(&mut tx, &mut fx, &new, Some(&invoice.id))
            .await
            .map_err(|err| match err {
                DbError::Domain(CoreError::AlreadyClaimed { code, held_by }) => {
                    DbError::Domain(CoreError::NotAvailable {
                        code,
                        tag: UnitTag::InCart,
                        held_by,
                    })
                }
                other => other,
            })?;
        unit::settle_in(&mut tx, &mut fx, &claimed.code, Some(&invoice.id)).await?;

        return_unit_in(&mut tx, &mut fx, &old.code, old_outcome, &invoice.id).await?;

        sqlx::query("UPDATE invoice_lines SET unit_code = ?1 WHERE id = ?2")
            .bind(&claimed.code)
            .bind(&line.id)
            .execute(&mut *tx)
            .await?;
        reconcile_in(&mut tx, &invoice.id).await?;

        self.hooks
            .audit
            .record(
                &mut tx,
                AuditEntry::new("invoice.replace_unit", "invoice_line", &line.id)
                    .before(&old.code)
                    .after(&claimed.code)
                    .correlated(Some(&invoice.id)),
            )
            .await;
        fx.batch.add(invoice_key(&invoice.id));

        let updated = settlement::load_line_in(&mut tx, &line.id).await?;
        tx.commit().await?;
        fx.release();

        info!(
            invoice_id = %invoice.id,
            line_id,
            old = %old.code,
            new = %claimed.code,
            "Unit replaced"
        );
        Ok(updated)
    }

    /// Several returns on one invoice, all or nothing.
    ///
    /// Requests are applied in a fixed order (tracked lines by unit row id,
    /// then ledger lines by line id) and the invoice is reconciled once.
    pub async fn process_replacement(
        &self,
        invoice_id: &str,
        requests: Vec<ReturnRequest>,
    ) -> DbResult<InvoiceView> {
        if requests.is_empty() {
            return Err(ValidationError::Required {
                field: "return lines".to_string(),
            }
            .into());
        }

        let mut tx = begin_write(&self.pool).await?;
        let mut fx = Effects::new(&self.hooks);

        let invoice = settlement::load_invoice_in(&mut tx, invoice_id).await?;

        let mut ordered = Vec::with_capacity(requests.len());
        for request in requests {
            let line = settlement::load_line_in(&mut tx, &request.line_id).await?;
            if line.invoice_id != invoice.id {
                return Err(CoreError::record_not_found("InvoiceLine", &request.line_id).into());
            }
            let unit_id = match line.unit_code.as_deref() {
                Some(code) => unit::resolve_in(&mut tx, code).await?.id,
                None => i64::MAX,
            };
            ordered.push((unit_id, line.id, request));
        }
        ordered.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        for (_, line_id, request) in &ordered {
            // Re-read: an earlier request may have touched the same line
            let line = settlement::load_line_in(&mut tx, line_id).await?;
            mark_returned_in(&mut tx, &mut fx, &invoice, &line, request.quantity, request.outcome)
                .await?;
        }
        let refund = reconcile_in(&mut tx, &invoice.id).await?;

        self.hooks
            .audit
            .record(
                &mut tx,
                AuditEntry::new("invoice.replacement", "invoice", &invoice.id).after(
                    serde_json::json!({
                        "lines": ordered.len(),
                        "refund_cents": refund.as_ref().map(|p| p.amount_cents).unwrap_or(0),
                    }),
                ),
            )
            .await;
        fx.batch.add(invoice_key(&invoice.id));

        let view = settlement::load_view_in(&mut tx, &invoice.id).await?;
        tx.commit().await?;
        fx.release();

        info!(invoice_id, lines = ordered.len(), "Replacement batch applied");
        Ok(view)
    }
}

// =============================================================================
// Transaction-Scoped Steps
// =============================================================================

fn not_eligible(line: &InvoiceLine, reason: impl Into<String>) -> DbError {
    CoreError::NotEligibleForReplacement {
        line_id: line.id.clone(),
        reason: reason.into(),
    }
    .into()
}

fn ensure_active(invoice: &Invoice, line: &InvoiceLine) -> DbResult<()> {
    if invoice.status.is_active() {
        Ok(())
    } else {
        Err(not_eligible(line, format!("invoice {} is {}", invoice.id, invoice.status)))
    }
}

/// Sold → Unknown, then on to the inspection outcome if one was given.
async fn return_unit_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    code: &str,
    outcome: ReturnOutcome,
    invoice_id: &str,
) -> DbResult<()> {
    unit::take_back_in(conn, fx, code, invoice_id).await?;
    if outcome != ReturnOutcome::Unknown {
        unit::update_tag_in(conn, fx, code, outcome.tag(), false, Some(invoice_id)).await?;
    }
    Ok(())
}

async fn mark_returned_in(
    conn: &mut SqliteConnection,
    fx: &mut Effects<'_>,
    invoice: &Invoice,
    line: &InvoiceLine,
    qty: i64,
    outcome: ReturnOutcome,
) -> DbResult<()> {
    ensure_active(invoice, line)?;

    let remaining = line.billable_quantity();
    if qty < 1 || qty > remaining {
        return Err(CoreError::InvalidReturnQuantity {
            line_id: line.id.clone(),
            requested: qty,
            remaining,
        }
        .into());
    }

    match line.unit_code.as_deref() {
        Some(code) => {
            let sold = unit::resolve_in(conn, code).await?;
            if sold.tag != UnitTag::Sold {
                return Err(not_eligible(line, format!("unit {} is {}", sold.code, sold.tag)));
            }
            return_unit_in(conn, fx, &sold.code, outcome, &invoice.id).await?;
        }
        None => {
            let variant = line.variant_id.as_deref();
            match unit::representative_in(conn, &line.product_id, variant).await? {
                Some(rep) if rep.tag == UnitTag::Sold => {}
                Some(rep) => {
                    return Err(not_eligible(
                        line,
                        format!("representative unit {} is {}", rep.code, rep.tag),
                    ))
                }
                None => return Err(not_eligible(line, "product has no representative unit")),
            }
            if outcome.restocks() {
                stock::restore_in(
                    conn,
                    fx,
                    &line.product_id,
                    variant,
                    &invoice.location_id,
                    qty,
                    Some(&invoice.id),
                )
                .await?;
            }
        }
    }

    let replaced = line.replaced_quantity + qty;
    if replaced == line.quantity {
        sqlx::query("DELETE FROM invoice_lines WHERE id = ?1")
            .bind(&line.id)
            .execute(&mut *conn)
            .await?;
        if !line.is_tracked() {
            settlement::restore_representative_in(
                conn,
                fx,
                &line.product_id,
                line.variant_id.as_deref(),
                &invoice.id,
            )
            .await?;
        }
    } else {
        sqlx::query("UPDATE invoice_lines SET replaced_quantity = ?1 WHERE id = ?2")
            .bind(replaced)
            .bind(&line.id)
            .execute(&mut *conn)
            .await?;
    }

    fx.hooks
        .audit
        .record(
            conn,
            AuditEntry::new("invoice.return", "invoice_line", &line.id)
                .before(serde_json::json!({ "replaced_quantity": line.replaced_quantity }))
                .after(serde_json::json!({
                    "replaced_quantity": replaced,
                    "outcome": outcome,
                }))
                .correlated(Some(&invoice.id)),
        )
        .await;

    debug!(line_id = %line.id, qty, ?outcome, "Line returned");
    Ok(())
}

/// Re-totals the invoice from its remaining lines. Any payment above the
/// new total goes back out as a refund record.
async fn reconcile_in(conn: &mut SqliteConnection, invoice_id: &str) -> DbResult<Option<Payment>> {
    let invoice = settlement::load_invoice_in(conn, invoice_id).await?;
    let lines = settlement::lines_in(conn, invoice_id).await?;
    let totals = InvoiceTotals::compute(&lines, Money::from_cents(invoice.discount_cents));

    let mut paid = invoice.paid();
    let refund = totals.refund(paid);
    let payment = if refund.is_positive() {
        let method = settlement::payments_in(conn, invoice_id)
            .await?
            .into_iter()
            .rev()
            .find(|p| p.kind == PaymentKind::Payment)
            .map(|p| p.method)
            .unwrap_or_else(|| FALLBACK_REFUND_METHOD.to_string());
        let payment =
            settlement::insert_payment_in(conn, invoice_id, PaymentKind::Refund, &method, refund.cents())
                .await?;
        paid -= refund;
        Some(payment)
    } else {
        None
    };

    settlement::store_totals_in(conn, invoice_id, &totals, paid).await?;
    debug!(
        invoice_id,
        total = %totals.total,
        paid = %paid,
        refund = %refund,
        "Invoice reconciled"
    );
    Ok(payment)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::AddToCart;
    use crate::pool::{Database, DbConfig};
    use crate::repository::{NewProduct, Receipt};
    use tillkeeper_core::{PaymentPlan, SettlementMode};

    async fn sold_invoice(db: &Database, product: &str, qty: i64, paid: i64) -> InvoiceView {
        let cart = db.carts().open_cart(None).await.unwrap();
        db.carts().add_to_cart(&cart.id, AddToCart::new(product, qty)).await.unwrap();
        db.invoices()
            .settle_cart(&cart.id, PaymentPlan::single("card", paid))
            .await
            .unwrap()
    }

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.products()
            .insert(NewProduct::tracked("Sneaker", 5000).with_id("sneaker"))
            .await
            .unwrap();
        db.products()
            .insert(NewProduct::untracked("Laces", 500).with_id("laces"))
            .await
            .unwrap();
        db.units().receive(Receipt::new("po-1", "sneaker", 3)).await.unwrap();
        db.units().receive(Receipt::new("po-1", "laces", 10)).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_tracked_return_chains_outcome() {
        let db = setup().await;
        let view = sold_invoice(&db, "sneaker", 1, 5000).await;
        let line = &view.lines[0];
        let code = line.unit_code.clone().unwrap();

        let after = db
            .replacements()
            .mark_returned(&line.id, 1, ReturnOutcome::Returned)
            .await
            .unwrap();

        assert!(after.lines.is_empty());
        assert_eq!(after.invoice.total_cents, 0);
        assert_eq!(after.invoice.paid_cents, 0);
        assert_eq!(after.payments.last().unwrap().kind, PaymentKind::Refund);
        assert_eq!(after.payments.last().unwrap().method, "card");
        assert_eq!(db.units().resolve(&code).await.unwrap().tag, UnitTag::Returned);
    }

    #[tokio::test]
    async fn test_ledger_return_restocks_only_when_returned() {
        let db = setup().await;
        let view = sold_invoice(&db, "laces", 4, 2000).await;
        let line_id = view.lines[0].id.clone();
        assert_eq!(db.stock().available("laces", None).await.unwrap(), 6);

        let after = db
            .replacements()
            .mark_returned(&line_id, 1, ReturnOutcome::Defective)
            .await
            .unwrap();
        assert_eq!(db.stock().available("laces", None).await.unwrap(), 6);
        assert_eq!(after.lines[0].replaced_quantity, 1);
        assert_eq!(after.invoice.total_cents, 1500);

        db.replacements()
            .mark_returned(&line_id, 2, ReturnOutcome::Returned)
            .await
            .unwrap();
        assert_eq!(db.stock().available("laces", None).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_full_ledger_return_frees_representative() {
        let db = setup().await;
        let view = sold_invoice(&db, "laces", 3, 1500).await;
        let representative = |db: Database| async move {
            db.units()
                .list_for_product("laces", None)
                .await
                .unwrap()
                .into_iter()
                .find(|u| u.is_primary)
                .unwrap()
                .tag
        };
        assert_eq!(representative(db.clone()).await, UnitTag::Sold);

        db.replacements()
            .mark_returned(&view.lines[0].id, 1, ReturnOutcome::Returned)
            .await
            .unwrap();
        assert_eq!(representative(db.clone()).await, UnitTag::Sold);

        let after = db
            .replacements()
            .mark_returned(&view.lines[0].id, 2, ReturnOutcome::Returned)
            .await
            .unwrap();
        assert!(after.lines.is_empty());
        assert_eq!(representative(db.clone()).await, UnitTag::New);
        assert_eq!(db.stock().available("laces", None).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_return_quantity_bounds() {
        let db = setup().await;
        let view = sold_invoice(&db, "laces", 2, 1000).await;
        let line_id = &view.lines[0].id;

        for qty in [0, 3] {
            let err = db
                .replacements()
                .mark_returned(line_id, qty, ReturnOutcome::Unknown)
                .await
                .unwrap_err();
            assert!(matches!(err, DbError::Domain(CoreError::InvalidReturnQuantity { .. })));
        }
    }

    #[tokio::test]
    async fn test_void_invoice_not_eligible() {
        let db = setup().await;
        let view = sold_invoice(&db, "sneaker", 1, 5000).await;
        db.invoices()
            .void_or_delete(&view.invoice.id, SettlementMode::Void, false)
            .await
            .unwrap();

        let err = db
            .replacements()
            .mark_returned(&view.lines[0].id, 1, ReturnOutcome::Unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Domain(CoreError::NotEligibleForReplacement { .. })));
    }

    #[tokio::test]
    async fn test_batch_rolls_back_on_bad_line() {
        let db = setup().await;
        let view = sold_invoice(&db, "sneaker", 2, 10000).await;
        let good = ReturnRequest {
            line_id: view.lines[0].id.clone(),
            quantity: 1,
            outcome: ReturnOutcome::Unknown,
        };
        let bad = ReturnRequest {
            line_id: view.lines[1].id.clone(),
            quantity: 5,
            outcome: ReturnOutcome::Unknown,
        };

        let err = db
            .replacements()
            .process_replacement(&view.invoice.id, vec![good, bad])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Domain(CoreError::InvalidReturnQuantity { .. })));

        let unchanged = db.invoices().get_invoice(&view.invoice.id).await.unwrap();
        assert_eq!(unchanged.lines.len(), 2);
        for line in &unchanged.lines {
            let code = line.unit_code.as_deref().unwrap();
            assert_eq!(db.units().resolve(code).await.unwrap().tag, UnitTag::Sold);
        }
    }
}
