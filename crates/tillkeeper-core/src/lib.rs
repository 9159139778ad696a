//! # tillkeeper-core: Unit Lifecycle Rules for Tillkeeper
//!
//! Everything about a physical unit's life that can be decided without
//! storage: which tag changes are legal, which tags are claimable, how
//! invoice totals and refunds are computed, and which manual prices are
//! acceptable.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tillkeeper Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              API layer (out of tree: HTTP, auth, search)        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tillkeeper-db                                │   │
//! │  │   UnitRegistry  StockLedger  Reservation  Settlement  Returns   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ asks before every write               │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tillkeeper-core (THIS CRATE) ★                  │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │    tag    │  │   types   │  │  totals   │  │ validation│  │   │
//! │  │   │  UnitTag  │  │ Cart/Inv  │  │  refunds  │  │ price     │  │   │
//! │  │   │  grammar  │  │ Payment   │  │  tax      │  │ floor     │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`tag`] - Unit tags, the transition table, the `Unit` row
//! - [`types`] - Products, carts, invoices, payments, collaborator payloads
//! - [`money`] - Integer-cent `Money` and `TaxRate`
//! - [`totals`] - Invoice totals, amount due, refunds
//! - [`error`] - The closed `CoreError` union
//! - [`validation`] - Input checks and the price floor
//!
//! ## Example
//!
//! ```rust
//! use tillkeeper_core::tag::{check_operator_update, UnitTag};
//! use tillkeeper_core::CoreError;
//!
//! // A new unit cannot be written off without being sold and returned first
//! let err = check_operator_update("A100", UnitTag::New, UnitTag::Defective, true).unwrap_err();
//! assert!(matches!(err, CoreError::InvalidTransition { .. }));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod money;
pub mod tag;
pub mod totals;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{CoreError, CoreResult, ErrorKind, ValidationError};
pub use money::{Money, TaxRate};
pub use tag::{Trigger, Unit, UnitTag};
pub use totals::InvoiceTotals;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum quantity on a single cart line or return.
pub const MAX_ITEM_QUANTITY: i64 = 999;

/// Length of generated unit codes (EAN-13).
pub const UNIT_CODE_LEN: usize = 13;

/// Length of generated unit aliases.
pub const UNIT_ALIAS_LEN: usize = 6;

/// Location used when a caller does not name one.
pub const DEFAULT_LOCATION_ID: &str = "main";

/// Actor recorded in the audit trail when none is configured.
pub const SYSTEM_ACTOR: &str = "system";
