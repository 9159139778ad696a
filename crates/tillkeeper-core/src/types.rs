//! # Domain Types
//!
//! Row-shaped types shared by the coordinators and the API layer.
//!
//! ## Ownership
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Product ─┬─ tracked ──────► Unit (one row per physical item)          │
//! │           └─ non-tracked ──► StockLevel (product, variant, location)   │
//! │                              + one representative Unit (is_primary)    │
//! │                                                                         │
//! │  Cart ──owns──► CartLine ──refers by code──► Unit                      │
//! │                                                                         │
//! │  Invoice ──owns──► InvoiceLine ──refers by code──► Unit                │
//! │          ──owns──► Payment (payment | refund)                          │
//! │                                                                         │
//! │  Lines never own units. A unit is found by code, never by pointer.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::money::{Money, TaxRate};
use crate::tag::UnitTag;

// =============================================================================
// Product
// =============================================================================

/// The slice of a catalog product the inventory core needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Product {
    pub id: String,
    pub name: String,

    /// Sold through individually identified units when true,
    /// through the stock ledger otherwise.
    pub tracked: bool,

    /// Manual prices may undercut cost.
    pub allow_below_cost: bool,

    /// List price in cents.
    pub price_cents: i64,

    /// Catalog cost in cents, used as the floor when a unit has none.
    pub cost_cents: Option<i64>,

    /// Tax rate in basis points.
    pub tax_rate_bps: i64,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Product {
    #[inline]
    pub fn price(&self) -> Money {
        Money::from_cents(self.price_cents)
    }

    #[inline]
    pub fn tax_rate(&self) -> TaxRate {
        TaxRate::from_bps(self.tax_rate_bps.clamp(0, u32::MAX as i64) as u32)
    }
}

// =============================================================================
// Stock Level
// =============================================================================

/// Aggregate quantity of a non-tracked product at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct StockLevel {
    pub product_id: String,
    /// Empty string when the product has no variants.
    pub variant_id: String,
    pub location_id: String,
    pub quantity: i64,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

/// Storage key for an optional variant. `None` and `Some("")` collide on purpose.
pub fn variant_key(variant_id: Option<&str>) -> &str {
    variant_id.unwrap_or("")
}

// =============================================================================
// Cart
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    /// Lines may be added and removed.
    Open,
    /// Converted into an invoice.
    Settled,
    /// Every claim released.
    Abandoned,
}

impl CartStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CartStatus::Open => "open",
            CartStatus::Settled => "settled",
            CartStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for CartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-progress sale at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Cart {
    pub id: String,
    /// Stock ledger location used for non-tracked reservations.
    pub location_id: String,
    pub status: CartStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

/// A pending sale line.
///
/// For tracked products `claimed_units.len() == quantity`; for non-tracked
/// products `claimed_units` is empty and the quantity lives in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct CartLine {
    pub id: String,
    pub cart_id: String,
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    pub unit_price_cents: i64,
    /// Price was typed in by the cashier rather than taken from the catalog.
    pub manual_price: bool,
    pub tracked: bool,

    /// Claimed unit codes in claim order. Stored in `cart_line_units`.
    #[cfg_attr(feature = "sqlx", sqlx(skip))]
    pub claimed_units: Vec<String>,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl CartLine {
    #[inline]
    pub fn unit_price(&self) -> Money {
        Money::from_cents(self.unit_price_cents)
    }

    pub fn line_total(&self) -> Money {
        self.unit_price().multiply_quantity(self.quantity)
    }

    /// Whether the claimed codes agree with the quantity.
    pub fn is_consistent(&self) -> bool {
        if self.tracked {
            self.claimed_units.len() as i64 == self.quantity
        } else {
            self.claimed_units.is_empty()
        }
    }
}

/// A cart with its lines, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CartView {
    pub cart: Cart,
    pub lines: Vec<CartLine>,
}

impl CartView {
    pub fn subtotal(&self) -> Money {
        self.lines.iter().map(CartLine::line_total).sum()
    }
}

// =============================================================================
// Invoice
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Active,
    Void,
    Deleted,
}

impl InvoiceStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Active => "active",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Deleted => "deleted",
        }
    }

    #[inline]
    pub const fn is_active(&self) -> bool {
        matches!(self, InvoiceStatus::Active)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an invoice is taken out of circulation. Both share the reversal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SettlementMode {
    Void,
    Delete,
}

impl SettlementMode {
    pub const fn target_status(&self) -> InvoiceStatus {
        match self {
            SettlementMode::Void => InvoiceStatus::Void,
            SettlementMode::Delete => InvoiceStatus::Deleted,
        }
    }
}

/// A settled sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Invoice {
    pub id: String,
    pub cart_id: String,
    pub location_id: String,
    pub status: InvoiceStatus,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub paid_cents: i64,
    pub due_cents: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    #[inline]
    pub fn paid(&self) -> Money {
        Money::from_cents(self.paid_cents)
    }
}

/// A committed sale line.
///
/// `quantity` is what was settled; returns raise `replaced_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct InvoiceLine {
    pub id: String,
    pub invoice_id: String,
    pub product_id: String,
    pub variant_id: Option<String>,
    /// Set for tracked lines (quantity 1), empty for ledger lines.
    pub unit_code: Option<String>,
    pub quantity: i64,
    pub replaced_quantity: i64,
    pub unit_price_cents: i64,
    pub tax_rate_bps: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl InvoiceLine {
    /// Quantity still billed on this line.
    #[inline]
    pub fn billable_quantity(&self) -> i64 {
        self.quantity - self.replaced_quantity
    }

    #[inline]
    pub fn is_tracked(&self) -> bool {
        self.unit_code.is_some()
    }

    pub fn net_amount(&self) -> Money {
        Money::from_cents(self.unit_price_cents).multiply_quantity(self.billable_quantity())
    }

    pub fn tax_rate(&self) -> TaxRate {
        TaxRate::from_bps(self.tax_rate_bps.clamp(0, u32::MAX as i64) as u32)
    }
}

/// An invoice with its lines and payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct InvoiceView {
    pub invoice: Invoice,
    pub lines: Vec<InvoiceLine>,
    pub payments: Vec<Payment>,
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Payment,
    Refund,
}

/// Money in (payment) or out (refund) against an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Payment {
    pub id: String,
    pub invoice_id: String,
    pub kind: PaymentKind,
    /// Tender label, e.g. "cash", "card".
    pub method: String,
    /// Always positive; direction comes from `kind`.
    pub amount_cents: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// One tender in a payment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Tender {
    pub method: String,
    pub amount_cents: i64,
}

/// How the customer pays at settlement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PaymentPlan {
    /// Flat discount on the subtotal.
    pub discount_cents: i64,
    pub tenders: Vec<Tender>,
}

impl PaymentPlan {
    /// A single tender covering `amount_cents`.
    pub fn single(method: impl Into<String>, amount_cents: i64) -> Self {
        PaymentPlan {
            discount_cents: 0,
            tenders: vec![Tender {
                method: method.into(),
                amount_cents,
            }],
        }
    }

    pub fn with_discount(mut self, discount_cents: i64) -> Self {
        self.discount_cents = discount_cents;
        self
    }

    pub fn tendered(&self) -> Money {
        self.tenders
            .iter()
            .map(|t| Money::from_cents(t.amount_cents))
            .sum()
    }
}

// =============================================================================
// Returns
// =============================================================================

/// Tag a returned unit ends up with after `mark_returned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ReturnOutcome {
    /// Not inspected yet.
    Unknown,
    Returned,
    Defective,
}

impl ReturnOutcome {
    pub const fn tag(&self) -> UnitTag {
        match self {
            ReturnOutcome::Unknown => UnitTag::Unknown,
            ReturnOutcome::Returned => UnitTag::Returned,
            ReturnOutcome::Defective => UnitTag::Defective,
        }
    }

    /// Returned goods are saleable again; the others stay off the shelf.
    pub const fn restocks(&self) -> bool {
        matches!(self, ReturnOutcome::Returned)
    }
}

/// One entry of a bulk return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ReturnRequest {
    pub line_id: String,
    pub quantity: i64,
    pub outcome: ReturnOutcome,
}

// =============================================================================
// Collaborator Payloads
// =============================================================================

/// What the label service needs to print one unit's label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LabelRequest {
    pub product_name: String,
    pub unit_code: String,
    pub alias: Option<String>,
    pub price_cents: i64,
    #[ts(as = "String")]
    pub received_at: DateTime<Utc>,
}

/// One row of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct AuditRecord {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub before_state: Option<String>,
    pub after_state: Option<String>,
    /// Cart or invoice the change belongs to.
    pub correlation_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn line(tracked: bool, quantity: i64, claimed: &[&str]) -> CartLine {
        CartLine {
            id: "l1".to_string(),
            cart_id: "c1".to_string(),
            product_id: "p1".to_string(),
            variant_id: None,
            quantity,
            unit_price_cents: 1250,
            manual_price: false,
            tracked,
            claimed_units: claimed.iter().map(|c| c.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_cart_line_consistency() {
        assert!(line(true, 2, &["A1", "A2"]).is_consistent());
        assert!(!line(true, 3, &["A1", "A2"]).is_consistent());
        assert!(line(false, 5, &[]).is_consistent());
        assert!(!line(false, 1, &["A1"]).is_consistent());
        assert_eq!(line(false, 4, &[]).line_total().cents(), 5000);
    }

    #[test]
    fn test_payment_plan() {
        let plan = PaymentPlan::single("cash", 10000).with_discount(500);
        assert_eq!(plan.tendered().cents(), 10000);
        assert_eq!(plan.discount_cents, 500);
    }

    #[test]
    fn test_return_outcome() {
        assert_eq!(ReturnOutcome::Defective.tag(), UnitTag::Defective);
        assert!(ReturnOutcome::Returned.restocks());
        assert!(!ReturnOutcome::Unknown.restocks());
    }

    #[test]
    fn test_variant_key() {
        assert_eq!(variant_key(None), "");
        assert_eq!(variant_key(Some("XL")), "XL");
    }
}
