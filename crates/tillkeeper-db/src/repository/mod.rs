//! # Repository Module
//!
//! Row owners. Each repository has a public handle that opens its own
//! transaction and crate-level `*_in` functions that run on a caller's
//! connection, which is how the coordinators compose several row changes
//! into one commit.
//!
//! ## Available Repositories
//!
//! - [`ProductRepository`] - the catalog flags inventory needs
//! - [`UnitRegistry`] - units and every tag transition
//! - [`StockLedger`] - aggregate quantity for non-tracked products

pub mod product;
pub mod stock;
pub mod unit;

pub use product::{NewProduct, ProductRepository};
pub use stock::StockLedger;
pub use unit::{Receipt, UnitRegistry};
