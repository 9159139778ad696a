//! # Unit Tags & Transition Grammar
//!
//! The one place that knows which tag changes are legal. Storage code asks
//! these functions before writing; nothing else compares raw tag values.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Unit Lifecycle                                     │
//! │                                                                         │
//! │            claim                  settle                                │
//! │   ┌─────┐ ───────► ┌────────┐ ──────────► ┌──────┐                     │
//! │   │ New │          │ InCart │             │ Sold │                     │
//! │   └─────┘ ◄─────── └────────┘             └──────┘                     │
//! │    ▲  │   release                          │  │ ▲                      │
//! │    │  └──────────── direct settle ─────────┼──┘ │                      │
//! │    │◄──────────── reversal (void/delete) ──┘    │                      │
//! │    │                                            │ replacement return   │
//! │    │ readmit (confirmed)                        ▼                      │
//! │  ┌─────────────────────┐  inspection  ┌─────────┐                      │
//! │  │ Returned | Defective│ ◄─────────── │ Unknown │                      │
//! │  └─────────────────────┘              └─────────┘                      │
//! │                                                                         │
//! │  Returned units are claimable directly (resale without readmit).       │
//! │  Defective units are never claimable.                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};

// =============================================================================
// Unit Tag
// =============================================================================

/// Lifecycle stage of a physical unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum UnitTag {
    /// Received and saleable.
    New,
    /// Reserved by exactly one open cart line.
    InCart,
    /// Sold on exactly one active invoice line.
    Sold,
    /// Came back and passed inspection; saleable again.
    Returned,
    /// Came back broken.
    Defective,
    /// Came back, not yet inspected.
    Unknown,
}

impl UnitTag {
    /// Every tag, in declaration order.
    pub const ALL: [UnitTag; 6] = [
        UnitTag::New,
        UnitTag::InCart,
        UnitTag::Sold,
        UnitTag::Returned,
        UnitTag::Defective,
        UnitTag::Unknown,
    ];

    /// Storage / wire representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            UnitTag::New => "new",
            UnitTag::InCart => "in_cart",
            UnitTag::Sold => "sold",
            UnitTag::Returned => "returned",
            UnitTag::Defective => "defective",
            UnitTag::Unknown => "unknown",
        }
    }

    /// Whether a cart may claim a unit carrying this tag.
    ///
    /// Returned units go straight back on sale; Defective never does.
    #[inline]
    pub const fn is_claimable(&self) -> bool {
        matches!(self, UnitTag::New | UnitTag::Returned)
    }

    /// Final outcomes an inspection can record.
    #[inline]
    pub const fn is_inspection_outcome(&self) -> bool {
        matches!(self, UnitTag::Returned | UnitTag::Defective)
    }
}

impl Default for UnitTag {
    fn default() -> Self {
        UnitTag::New
    }
}

impl fmt::Display for UnitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitTag {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "new" => Ok(UnitTag::New),
            "in_cart" | "incart" => Ok(UnitTag::InCart),
            "sold" => Ok(UnitTag::Sold),
            "returned" => Ok(UnitTag::Returned),
            "defective" => Ok(UnitTag::Defective),
            "unknown" => Ok(UnitTag::Unknown),
            other => Err(ValidationError::InvalidFormat {
                field: "tag".to_string(),
                reason: format!("unknown tag '{}'", other),
            }),
        }
    }
}

// =============================================================================
// Transition Table
// =============================================================================

/// What caused a tag change. Each table row belongs to exactly one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Cart line claims the unit.
    Claim,
    /// Cart line removed, decremented or abandoned.
    Release,
    /// Cart settled into an invoice (or line created pre-claimed).
    Settle,
    /// Sold unit handed back through the replacement workflow.
    ReplacementReturn,
    /// Invoice voided/deleted with stock restoration.
    Reversal,
    /// Inspection of a returned unit.
    Inspection,
    /// Returned/Defective unit put back on sale.
    Readmit,
}

impl Trigger {
    /// Triggers an operator may fire through a plain tag update.
    ///
    /// Cart and invoice triggers need their owning cart or invoice in hand,
    /// so they only run through the coordinators.
    pub const fn is_operator(&self) -> bool {
        matches!(
            self,
            Trigger::ReplacementReturn | Trigger::Inspection | Trigger::Readmit
        )
    }

    /// Whether firing this trigger needs an explicit confirmation flag.
    pub const fn needs_confirmation(&self) -> bool {
        matches!(self, Trigger::Readmit)
    }
}

/// The complete transition table. Anything not listed is illegal.
const TRANSITIONS: &[(UnitTag, UnitTag, Trigger)] = &[
    (UnitTag::New, UnitTag::InCart, Trigger::Claim),
    (UnitTag::InCart, UnitTag::New, Trigger::Release),
    (UnitTag::InCart, UnitTag::Sold, Trigger::Settle),
    (UnitTag::New, UnitTag::Sold, Trigger::Settle),
    (UnitTag::Sold, UnitTag::Unknown, Trigger::ReplacementReturn),
    (UnitTag::Sold, UnitTag::New, Trigger::Reversal),
    (UnitTag::Unknown, UnitTag::Returned, Trigger::Inspection),
    (UnitTag::Unknown, UnitTag::Defective, Trigger::Inspection),
    (UnitTag::Returned, UnitTag::New, Trigger::Readmit),
    (UnitTag::Defective, UnitTag::New, Trigger::Readmit),
];

/// Looks up the trigger that owns the `from → to` edge.
pub fn trigger_for(from: UnitTag, to: UnitTag) -> Option<Trigger> {
    TRANSITIONS
        .iter()
        .find(|(f, t, _)| *f == from && *t == to)
        .map(|(_, _, trigger)| *trigger)
}

/// Checks a transition requested by a coordinator with a known trigger.
///
/// Claiming is special-cased: `Returned` units are claimable too, which is
/// the resale policy rather than a table row.
pub fn check_transition(code: &str, from: UnitTag, to: UnitTag, trigger: Trigger) -> CoreResult<()> {
    let allowed = match trigger {
        Trigger::Claim => from.is_claimable() && to == UnitTag::InCart,
        _ => trigger_for(from, to) == Some(trigger),
    };

    if allowed {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            code: code.to_string(),
            from,
            to,
        })
    }
}

/// Checks an operator tag update (`update_tag`).
///
/// ## Outcomes
/// ```text
/// Sold → Unknown                     Ok(ReplacementReturn)
/// Unknown → Returned | Defective     Ok(Inspection)
/// Returned | Defective → New         Ok(Readmit) if confirmed
///                                    ConfirmationRequired otherwise
/// anything else                      InvalidTransition
/// ```
pub fn check_operator_update(
    code: &str,
    from: UnitTag,
    to: UnitTag,
    confirmed: bool,
) -> CoreResult<Trigger> {
    match trigger_for(from, to) {
        Some(trigger) if trigger.is_operator() => {
            if trigger.needs_confirmation() && !confirmed {
                Err(CoreError::ConfirmationRequired {
                    code: code.to_string(),
                    from,
                })
            } else {
                Ok(trigger)
            }
        }
        _ => Err(CoreError::InvalidTransition {
            code: code.to_string(),
            from,
            to,
        }),
    }
}

/// Classifies why a claim on a unit with `tag` cannot proceed.
pub fn claim_refusal(code: &str, tag: UnitTag, held_by: Option<String>) -> CoreError {
    match tag {
        UnitTag::InCart => CoreError::AlreadyClaimed {
            code: code.to_string(),
            held_by,
        },
        _ => CoreError::NotAvailable {
            code: code.to_string(),
            tag,
            held_by,
        },
    }
}

// =============================================================================
// Unit
// =============================================================================

/// One physical, individually trackable item (a "barcode").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Unit {
    /// Row id; lock ordering for bulk operations follows it.
    pub id: i64,

    /// Primary scan code (13 digits for generated codes).
    pub code: String,

    /// Optional short alias, resolves to the same unit.
    pub alias: Option<String>,

    pub tag: UnitTag,
    pub product_id: String,
    pub variant_id: Option<String>,

    /// Provenance.
    pub purchase_id: Option<String>,
    pub purchase_line_id: Option<String>,

    /// Representative unit of a non-tracked product.
    pub is_primary: bool,

    /// Purchase cost in cents, the floor for manual prices.
    pub cost_cents: Option<i64>,

    /// Recorded selling price in cents.
    pub price_cents: Option<i64>,

    /// Set on first settlement; sold units survive purchase deletion.
    pub ever_sold: bool,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    /// Whether `product_id`/`variant_id` describe this unit.
    pub fn matches(&self, product_id: &str, variant_id: Option<&str>) -> bool {
        self.product_id == product_id && self.variant_id.as_deref() == variant_id
    }

    /// Guard used before claiming a scanned unit.
    pub fn ensure_matches(&self, product_id: &str, variant_id: Option<&str>) -> CoreResult<()> {
        if self.matches(product_id, variant_id) {
            return Ok(());
        }
        Err(CoreError::ProductMismatch {
            code: self.code.clone(),
            expected_product: product_id.to_string(),
            expected_variant: variant_id.map(str::to_string),
            actual_product: self.product_id.clone(),
            actual_variant: self.variant_id.clone(),
        })
    }

    /// Cache keys to invalidate after this unit changes.
    pub fn cache_keys(&self) -> Vec<String> {
        let mut keys = vec![unit_cache_key(&self.code)];
        if let Some(alias) = &self.alias {
            keys.push(unit_cache_key(alias));
        }
        keys
    }
}

/// Cache key for a unit code or alias.
pub fn unit_cache_key(code: &str) -> String {
    format!("unit:{}", code)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const OPERATOR_ROWS: &[(UnitTag, UnitTag)] = &[
        (UnitTag::Sold, UnitTag::Unknown),
        (UnitTag::Unknown, UnitTag::Returned),
        (UnitTag::Unknown, UnitTag::Defective),
        (UnitTag::Returned, UnitTag::New),
        (UnitTag::Defective, UnitTag::New),
    ];

    #[test]
    fn test_every_pair_outside_table_is_invalid() {
        for from in UnitTag::ALL {
            for to in UnitTag::ALL {
                let in_table = trigger_for(from, to).is_some();
                let result = check_operator_update("A100", from, to, true);
                if !in_table {
                    assert!(
                        matches!(result, Err(CoreError::InvalidTransition { .. })),
                        "{} -> {} should be invalid",
                        from,
                        to
                    );
                }
            }
        }
    }

    #[test]
    fn test_operator_rows() {
        for (from, to) in OPERATOR_ROWS {
            assert!(check_operator_update("A100", *from, *to, true).is_ok());
        }
        // Cart/invoice rows are not reachable by a plain tag update
        assert!(matches!(
            check_operator_update("A100", UnitTag::Sold, UnitTag::New, true),
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            check_operator_update("A100", UnitTag::New, UnitTag::InCart, true),
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_readmit_needs_confirmation() {
        let result = check_operator_update("A100", UnitTag::Defective, UnitTag::New, false);
        assert_eq!(
            result,
            Err(CoreError::ConfirmationRequired {
                code: "A100".to_string(),
                from: UnitTag::Defective,
            })
        );
        assert_eq!(
            check_operator_update("A100", UnitTag::Returned, UnitTag::New, true),
            Ok(Trigger::Readmit)
        );
    }

    #[test]
    fn test_new_cannot_be_tagged_returned_or_defective() {
        for to in [UnitTag::Returned, UnitTag::Defective] {
            assert!(matches!(
                check_operator_update("A100", UnitTag::New, to, true),
                Err(CoreError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn test_claim_accepts_new_and_returned_only() {
        for from in UnitTag::ALL {
            let result = check_transition("A100", from, UnitTag::InCart, Trigger::Claim);
            assert_eq!(result.is_ok(), from.is_claimable(), "claim from {}", from);
        }
        assert!(!UnitTag::Defective.is_claimable());
    }

    #[test]
    fn test_trigger_must_own_edge() {
        // Sold → New exists, but only for reversal
        assert!(check_transition("A100", UnitTag::Sold, UnitTag::New, Trigger::Reversal).is_ok());
        assert!(check_transition("A100", UnitTag::Sold, UnitTag::New, Trigger::Release).is_err());
        assert!(check_transition("A100", UnitTag::New, UnitTag::Sold, Trigger::Settle).is_ok());
    }

    #[test]
    fn test_claim_refusal_classification() {
        assert!(matches!(
            claim_refusal("A100", UnitTag::InCart, None),
            CoreError::AlreadyClaimed { .. }
        ));
        assert!(matches!(
            claim_refusal("A100", UnitTag::Defective, None),
            CoreError::NotAvailable { .. }
        ));
    }

    #[test]
    fn test_tag_parsing() {
        for tag in UnitTag::ALL {
            assert_eq!(tag.as_str().parse::<UnitTag>().unwrap(), tag);
        }
        assert!("lost".parse::<UnitTag>().is_err());
    }
}
