//! # tillkeeper-db: Inventory Persistence and Coordinators
//!
//! SQLite storage (sqlx) for units, stock levels, carts and invoices, and
//! the coordinators that move units through their lifecycle.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Tillkeeper Data Flow                              │
//! │                                                                         │
//! │  POS request (scan, add line, settle, return)                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  tillkeeper-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐   ┌────────────────┐   ┌───────────────┐   │   │
//! │  │   │  coordinator  │──►│   repository   │   │  migrations   │   │   │
//! │  │   │  reservation  │   │  UnitRegistry  │   │  (embedded)   │   │   │
//! │  │   │  settlement   │   │  StockLedger   │   │               │   │   │
//! │  │   │  replacement  │   │  Products      │   │ 001_init.sql  │   │   │
//! │  │   └───────────────┘   └────────────────┘   └───────────────┘   │   │
//! │  │           │ after commit                                        │   │
//! │  │           ▼                                                     │   │
//! │  │   cache invalidation · label queue      (audit: same tx)        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database (WAL, busy_timeout = lock_timeout)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool, lock timeouts, shared hooks
//! - [`config`] - `inventory.toml` loading and environment overrides
//! - [`repository`] - Unit Registry, Stock Ledger, products
//! - [`coordinator`] - Reservation, settlement and replacement workflows
//! - [`cache`], [`audit`], [`labels`] - Collaborator seams
//! - [`migrations`] - Embedded schema migrations
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tillkeeper_db::{AddToCart, Database, DbConfig};
//! use tillkeeper_core::PaymentPlan;
//!
//! let db = Database::new(DbConfig::new("tillkeeper.db")).await?;
//!
//! let cart = db.carts().open_cart(None).await?;
//! db.carts().add_to_cart(&cart.id, AddToCart::scan("shirt-m", "A100")).await?;
//! let invoice = db.invoices().settle_cart(&cart.id, PaymentPlan::single("cash", 2900)).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod audit;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod labels;
pub mod migrations;
pub mod pool;
pub mod repository;

mod effects;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::{CacheError, CacheInvalidator, NoopInvalidator, RecordingInvalidator};
pub use config::{InventoryConfig, InventorySettings};
pub use coordinator::{
    AddToCart, ReplacementCoordinator, ReservationCoordinator, SettlementCoordinator,
};
pub use error::{DbError, DbResult};
pub use labels::LabelQueue;
pub use pool::{Database, DbConfig};

pub use repository::{NewProduct, ProductRepository, Receipt, StockLedger, UnitRegistry};
