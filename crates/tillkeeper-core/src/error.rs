//! # Error Types
//!
//! Domain-specific error types for tillkeeper-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tillkeeper-core errors (this file)                                    │
//! │  ├── CoreError        - Closed set of inventory outcomes               │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tillkeeper-db errors (separate crate)                                 │
//! │  └── DbError          - Storage failures, carries CoreError through    │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → API layer → Operator    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Every variant is recoverable and surfaced to the caller
//! 2. Variants carry the codes/ids an operator needs to act on the message
//! 3. `kind()` gives the API layer a stable machine-readable code

use serde::Serialize;
use thiserror::Error;

use crate::tag::UnitTag;

// =============================================================================
// Core Error
// =============================================================================

/// Inventory and reservation errors.
///
/// None of these is ever turned into a silent fallback: a failed claim,
/// reserve or transition aborts the surrounding transaction and reaches the
/// caller as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Code or alias does not resolve to a live unit.
    #[error("No unit found for code '{code}'")]
    NotFound { code: String },

    /// Scanned unit belongs to another product or variant.
    ///
    /// ## User Workflow
    /// ```text
    /// Cashier picks "Blue Shirt M" and scans A100
    ///      │
    ///      ▼
    /// A100 is registered to "Blue Shirt L"
    ///      │
    ///      ▼
    /// ProductMismatch → "A100 belongs to product P-L, not P-M"
    /// ```
    #[error("Unit {code} belongs to product {actual_product}{}, not {expected_product}{}",
        fmt_variant(.actual_variant), fmt_variant(.expected_variant))]
    ProductMismatch {
        code: String,
        expected_product: String,
        expected_variant: Option<String>,
        actual_product: String,
        actual_variant: Option<String>,
    },

    /// Unit is already reserved by an open cart.
    #[error("Unit {code} is already claimed{}", fmt_holder(.held_by))]
    AlreadyClaimed {
        code: String,
        held_by: Option<String>,
    },

    /// Unit is in a state that cannot be claimed (sold, defective, ...).
    #[error("Unit {code} is not available ({tag}){}", fmt_holder(.held_by))]
    NotAvailable {
        code: String,
        tag: UnitTag,
        held_by: Option<String>,
    },

    /// Not enough units or ledger quantity to satisfy the request.
    #[error("Insufficient stock for product {product_id}: available {available}, requested {requested}")]
    InsufficientStock {
        product_id: String,
        available: i64,
        requested: i64,
    },

    /// The requested tag change is not in the transition table.
    #[error("Cannot move unit {code} from {from} to {to}")]
    InvalidTransition {
        code: String,
        from: UnitTag,
        to: UnitTag,
    },

    /// Transition is legal but needs `confirmed = true`.
    #[error("Moving unit {code} from {from} back to saleable stock needs confirmation")]
    ConfirmationRequired { code: String, from: UnitTag },

    /// Invoice line does not point at a sold unit on an active invoice.
    #[error("Invoice line {line_id} is not eligible for replacement: {reason}")]
    NotEligibleForReplacement { line_id: String, reason: String },

    /// Lock could not be acquired within the configured wait.
    #[error("{resource} is busy, retry the operation")]
    Busy { resource: String },

    /// Manual price undercuts the cost floor of a product that forbids it.
    #[error("Price {price_cents} is below the floor of {floor_cents} for product {product_id}")]
    PriceBelowFloor {
        product_id: String,
        price_cents: i64,
        floor_cents: i64,
    },

    /// Cart has already been settled or abandoned.
    #[error("Cart {cart_id} is {status}, cannot perform operation")]
    CartNotOpen { cart_id: String, status: String },

    /// Cart, cart line, invoice or invoice line id does not exist.
    #[error("{entity} not found: {id}")]
    RecordNotFound { entity: String, id: String },

    /// Return quantity is zero or exceeds what is left on the line.
    #[error("Cannot return {requested} from line {line_id}, only {remaining} left")]
    InvalidReturnQuantity {
        line_id: String,
        requested: i64,
        remaining: i64,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

fn fmt_variant(variant: &Option<String>) -> String {
    variant
        .as_deref()
        .map(|v| format!(" / variant {}", v))
        .unwrap_or_default()
}

fn fmt_holder(held_by: &Option<String>) -> String {
    held_by
        .as_deref()
        .map(|h| format!(": held by {}", h))
        .unwrap_or_default()
}

impl CoreError {
    /// Shorthand for [`CoreError::RecordNotFound`].
    pub fn record_not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        CoreError::RecordNotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Shorthand for [`CoreError::Busy`].
    pub fn busy(resource: impl Into<String>) -> Self {
        CoreError::Busy {
            resource: resource.into(),
        }
    }

    /// Machine-readable classification for the API layer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound { .. } | CoreError::RecordNotFound { .. } => ErrorKind::NotFound,
            CoreError::ProductMismatch { .. } => ErrorKind::ProductMismatch,
            CoreError::AlreadyClaimed { .. } => ErrorKind::AlreadyClaimed,
            CoreError::NotAvailable { .. } => ErrorKind::NotAvailable,
            CoreError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            CoreError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            CoreError::ConfirmationRequired { .. } => ErrorKind::ConfirmationRequired,
            CoreError::NotEligibleForReplacement { .. } => ErrorKind::NotEligibleForReplacement,
            CoreError::Busy { .. } => ErrorKind::Busy,
            CoreError::PriceBelowFloor { .. }
            | CoreError::CartNotOpen { .. }
            | CoreError::InvalidReturnQuantity { .. }
            | CoreError::Validation(_) => ErrorKind::Rejected,
        }
    }

    /// True when the caller may simply retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Busy { .. })
    }
}

/// Stable error codes for the API layer.
///
/// ```json
/// { "code": "ALREADY_CLAIMED", "message": "Unit A100 is already claimed: held by cart 7f3e..." }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    ProductMismatch,
    AlreadyClaimed,
    NotAvailable,
    InsufficientStock,
    InvalidTransition,
    ConfirmationRequired,
    NotEligibleForReplacement,
    Busy,
    /// Business rule or input rejection (price floor, closed cart, bad qty).
    Rejected,
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any claim or reserve call so a rejected request never
/// leaves a unit half-claimed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., invalid UUID, bad code characters).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_available_names_holder() {
        let err = CoreError::NotAvailable {
            code: "A100".to_string(),
            tag: UnitTag::Sold,
            held_by: Some("invoice INV-7".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Unit A100 is not available (sold): held by invoice INV-7"
        );
    }

    #[test]
    fn test_product_mismatch_message() {
        let err = CoreError::ProductMismatch {
            code: "A100".to_string(),
            expected_product: "P2".to_string(),
            expected_variant: None,
            actual_product: "P1".to_string(),
            actual_variant: Some("XL".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Unit A100 belongs to product P1 / variant XL, not P2"
        );
    }

    #[test]
    fn test_kinds() {
        assert_eq!(CoreError::busy("unit A100").kind(), ErrorKind::Busy);
        assert!(CoreError::busy("unit A100").is_retryable());
        assert_eq!(
            CoreError::record_not_found("Cart", "c1").kind(),
            ErrorKind::NotFound
        );

        let validation: CoreError = ValidationError::Required {
            field: "code".to_string(),
        }
        .into();
        assert_eq!(validation.kind(), ErrorKind::Rejected);
        assert!(!validation.is_retryable());
    }

    #[test]
    fn test_error_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::NotEligibleForReplacement).unwrap();
        assert_eq!(json, "\"NOT_ELIGIBLE_FOR_REPLACEMENT\"");
    }
}
