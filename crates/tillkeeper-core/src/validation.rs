//! # Validation
//!
//! Pure checks that run before any claim or reserve call, so a rejected
//! request never leaves a unit half-claimed or a ledger row decremented.
//!
//! ```text
//! add_to_cart(request)
//!      │
//!      ├── validate_quantity          ─┐
//!      ├── validate_code (if scanned)  ├── this module, no locks held
//!      ├── check_price_floor          ─┘
//!      │
//!      ▼
//! try_claim / reserve  (transaction, row-level CAS)
//! ```

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::Product;
use crate::MAX_ITEM_QUANTITY;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest code or alias accepted from a scanner.
pub const MAX_CODE_LEN: usize = 64;

// =============================================================================
// Codes
// =============================================================================

/// Validates a scanned code or alias.
///
/// ## Rules
/// - Not empty after trimming
/// - At most [`MAX_CODE_LEN`] characters
/// - ASCII letters, digits, `-` and `_` only
///
/// ```rust
/// use tillkeeper_core::validation::validate_code;
///
/// assert_eq!(validate_code(" A100 ").unwrap(), "A100");
/// assert!(validate_code("").is_err());
/// assert!(validate_code("A 100").is_err());
/// ```
pub fn validate_code(code: &str) -> ValidationResult<&str> {
    let code = code.trim();

    if code.is_empty() {
        return Err(ValidationError::Required {
            field: "code".to_string(),
        });
    }

    if code.len() > MAX_CODE_LEN {
        return Err(ValidationError::TooLong {
            field: "code".to_string(),
            max: MAX_CODE_LEN,
        });
    }

    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "code".to_string(),
            reason: "must contain only letters, digits, hyphens, and underscores".to_string(),
        });
    }

    Ok(code)
}

/// EAN-13 check digit for a 12-digit body.
///
/// Returns `None` if the body is not exactly 12 ASCII digits.
pub fn ean13_check_digit(body: &str) -> Option<u8> {
    if body.len() != 12 || !body.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let sum: u32 = body
        .bytes()
        .enumerate()
        .map(|(i, b)| {
            let digit = (b - b'0') as u32;
            if i % 2 == 0 {
                digit
            } else {
                digit * 3
            }
        })
        .sum();
    Some(((10 - sum % 10) % 10) as u8)
}

/// Whether `code` is a 13-digit code with a valid EAN-13 check digit.
pub fn is_valid_ean13(code: &str) -> bool {
    if code.len() != 13 {
        return false;
    }
    let (body, check) = code.split_at(12);
    match (ean13_check_digit(body), check.bytes().next()) {
        (Some(expected), Some(actual)) => actual == b'0' + expected,
        _ => false,
    }
}

// =============================================================================
// Numbers
// =============================================================================

/// Validates a line quantity: `1..=MAX_ITEM_QUANTITY`.
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_ITEM_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_ITEM_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a price in cents. Zero is allowed.
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: "price".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }
    Ok(())
}

/// Validates a tender or discount amount.
pub fn validate_amount_cents(field: &str, cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: i64::MAX,
        });
    }
    Ok(())
}

// =============================================================================
// Price Floor
// =============================================================================

/// Rejects a manual price below the floor unless the product allows it.
///
/// The floor is the unit's recorded purchase cost when known, otherwise the
/// catalog cost. A product with neither has no floor.
///
/// ```rust
/// use tillkeeper_core::validation::price_floor;
///
/// assert_eq!(price_floor(Some(700), Some(500)), Some(700));
/// assert_eq!(price_floor(None, Some(500)), Some(500));
/// assert_eq!(price_floor(None, None), None);
/// ```
pub fn check_price_floor(
    product: &Product,
    unit_cost_cents: Option<i64>,
    price_cents: i64,
) -> CoreResult<()> {
    validate_price_cents(price_cents)?;

    if product.allow_below_cost {
        return Ok(());
    }

    match price_floor(unit_cost_cents, product.cost_cents) {
        Some(floor) if price_cents < floor => Err(CoreError::PriceBelowFloor {
            product_id: product.id.clone(),
            price_cents,
            floor_cents: floor,
        }),
        _ => Ok(()),
    }
}

/// Floor for a manual price: unit cost first, catalog cost second.
pub fn price_floor(unit_cost_cents: Option<i64>, catalog_cost_cents: Option<i64>) -> Option<i64> {
    unit_cost_cents.or(catalog_cost_cents)
}

// =============================================================================
// Unit Tests
// =============================================================================
