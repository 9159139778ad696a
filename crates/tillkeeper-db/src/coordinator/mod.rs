//! # Coordinators
//!
//! Workflows that span several rows. Each public call is one write
//! transaction; unit tags only ever change through the Unit Registry's
//! transaction-scoped functions.
//!
//! ```text
//! ┌──────────────────┐  claim / release   ┌───────────────┐
//! │   reservation    │ ─────────────────► │ UnitRegistry  │
//! │  (carts, lines)  │ ── reserve ──┐     └───────────────┘
//! └────────┬─────────┘              │            ▲  ▲
//!          │ settle_cart            ▼            │  │
//! ┌────────▼─────────┐       ┌─────────────┐     │  │
//! │   settlement     │ ────► │ StockLedger │     │  │
//! │ (invoices, pay)  │ ──────┴─────────────┴─────┘  │
//! └────────┬─────────┘                              │
//!          │ returns / swaps                        │
//! ┌────────▼─────────┐                              │
//! │   replacement    │ ─────────────────────────────┘
//! └──────────────────┘
//! ```

pub mod replacement;
pub mod reservation;
pub mod settlement;

pub use replacement::ReplacementCoordinator;
pub use reservation::{AddToCart, ReservationCoordinator};
pub use settlement::SettlementCoordinator;
