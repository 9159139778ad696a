//! # Invoice Totals
//!
//! ```text
//! subtotal = Σ unit_price × billable_quantity
//! tax      = Σ per-line tax on the line's share of (subtotal − discount)
//! total    = subtotal − discount + tax
//! due      = max(total − paid, 0)
//! refund   = max(paid − total, 0)
//! ```
//!
//! Recomputed from the lines every time an invoice changes, never patched
//! incrementally.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::Money;
use crate::types::InvoiceLine;

/// Computed amounts for an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InvoiceTotals {
    pub subtotal: Money,
    pub discount: Money,
    pub tax: Money,
    pub total: Money,
}

impl InvoiceTotals {
    /// Computes totals from the lines still on the invoice.
    ///
    /// The discount is capped at the subtotal and spread over lines
    /// proportionally before tax, so a return never produces negative tax.
    pub fn compute(lines: &[InvoiceLine], discount: Money) -> Self {
        let subtotal: Money = lines.iter().map(InvoiceLine::net_amount).sum();
        let discount = if discount.is_negative() {
            Money::zero()
        } else {
            discount.min(subtotal)
        };

        let mut tax = Money::zero();
        if subtotal.is_positive() {
            for line in lines {
                let net = line.net_amount();
                let share = (discount.cents() as i128 * net.cents() as i128
                    / subtotal.cents() as i128) as i64;
                tax += (net - Money::from_cents(share)).calculate_tax(line.tax_rate());
            }
        }

        InvoiceTotals {
            subtotal,
            discount,
            tax,
            total: subtotal - discount + tax,
        }
    }

    /// Amount still owed given what has been paid.
    pub fn due(&self, paid: Money) -> Money {
        self.total.saturating_sub_to_zero(paid)
    }

    /// Amount to hand back given what has been paid.
    pub fn refund(&self, paid: Money) -> Money {
        paid.saturating_sub_to_zero(self.total)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn line(price: i64, qty: i64, replaced: i64, tax_bps: i64) -> InvoiceLine {
        InvoiceLine {
            id: "l".to_string(),
            invoice_id: "i".to_string(),
            product_id: "p".to_string(),
            variant_id: None,
            unit_code: None,
            quantity: qty,
            replaced_quantity: replaced,
            unit_price_cents: price,
            tax_rate_bps: tax_bps,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_untaxed_totals() {
        let totals = InvoiceTotals::compute(&[line(4000, 1, 0, 0), line(3000, 2, 0, 0)], Money::zero());
        assert_eq!(totals.subtotal.cents(), 10000);
        assert_eq!(totals.total.cents(), 10000);
    }

    #[test]
    fn test_replaced_quantity_is_not_billed() {
        let totals = InvoiceTotals::compute(&[line(2000, 5, 2, 0)], Money::zero());
        assert_eq!(totals.total.cents(), 6000);
    }

    #[test]
    fn test_discount_before_tax() {
        // (10000 - 1000) at 10% = 900 tax
        let totals = InvoiceTotals::compute(&[line(10000, 1, 0, 1000)], Money::from_cents(1000));
        assert_eq!(totals.tax.cents(), 900);
        assert_eq!(totals.total.cents(), 9900);
    }

    #[test]
    fn test_discount_capped_at_subtotal() {
        let totals = InvoiceTotals::compute(&[line(500, 1, 0, 0)], Money::from_cents(900));
        assert_eq!(totals.discount.cents(), 500);
        assert!(totals.total.is_zero());
    }

    #[test]
    fn test_refund_on_price_drop() {
        let totals = InvoiceTotals::compute(&[line(6000, 1, 0, 0)], Money::zero());
        let paid = Money::from_cents(10000);
        assert_eq!(totals.refund(paid).cents(), 4000);
        assert!(totals.due(paid).is_zero());
    }
}
