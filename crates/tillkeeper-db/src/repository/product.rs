//! # Product Repository
//!
//! The catalog itself lives elsewhere. This table only holds the flags the
//! inventory core needs: tracked or not, price, cost and whether manual
//! prices may undercut cost.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use tillkeeper_core::validation::validate_price_cents;
use tillkeeper_core::{CoreError, Product, ValidationError};

use crate::error::DbResult;

/// Fields for [`ProductRepository::insert`].
#[derive(Debug, Clone)]
pub struct NewProduct {
    /// Generated when `None`.
    pub id: Option<String>,
    pub name: String,
    pub tracked: bool,
    pub allow_below_cost: bool,
    pub price_cents: i64,
    pub cost_cents: Option<i64>,
    pub tax_rate_bps: i64,
}

impl NewProduct {
    /// A tracked product with no tax and no cost floor.
    pub fn tracked(name: impl Into<String>, price_cents: i64) -> Self {
        NewProduct {
            id: None,
            name: name.into(),
            tracked: true,
            allow_below_cost: false,
            price_cents,
            cost_cents: None,
            tax_rate_bps: 0,
        }
    }

    /// A ledger-counted product.
    pub fn untracked(name: impl Into<String>, price_cents: i64) -> Self {
        NewProduct {
            tracked: false,
            ..Self::tracked(name, price_cents)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn cost(mut self, cost_cents: i64) -> Self {
        self.cost_cents = Some(cost_cents);
        self
    }

    pub fn tax_bps(mut self, bps: i64) -> Self {
        self.tax_rate_bps = bps;
        self
    }

    pub fn allow_below_cost(mut self, allow: bool) -> Self {
        self.allow_below_cost = allow;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProductRepository { pool }
    }

    pub async fn insert(&self, new: NewProduct) -> DbResult<Product> {
        if new.name.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "name".to_string(),
            }
            .into());
        }
        validate_price_cents(new.price_cents)?;

        let now = Utc::now();
        let product = Product {
            id: new.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: new.name.trim().to_string(),
            tracked: new.tracked,
            allow_below_cost: new.allow_below_cost,
            price_cents: new.price_cents,
            cost_cents: new.cost_cents,
            tax_rate_bps: new.tax_rate_bps,
            created_at: now,
            updated_at: now,
        };

        debug!(id = %product.id, tracked = product.tracked, "Inserting product");

        sqlx::query(
            r#"
            INSERT INTO products (
                id, name, tracked, allow_below_cost,
                price_cents, cost_cents, tax_rate_bps,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&product.id)
        .bind(&product.name)
        .bind(product.tracked)
        .bind(product.allow_below_cost)
        .bind(product.price_cents)
        .bind(product.cost_cents)
        .bind(product.tax_rate_bps)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(product)
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Product>> {
        let mut conn = self.pool.acquire().await?;
        find_in(&mut conn, id).await
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

const SELECT_PRODUCT: &str = r#"
    SELECT id, name, tracked, allow_below_cost, price_cents, cost_cents,
           tax_rate_bps, created_at, updated_at
    FROM products
"#;

pub(crate) async fn find_in(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Product>> {
    let product = sqlx::query_as::<_, Product>(&format!("{} WHERE id = ?1", SELECT_PRODUCT))
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(product)
}

/// Loads a product or fails with `RecordNotFound`.
pub(crate) async fn get_in(conn: &mut SqliteConnection, id: &str) -> DbResult<Product> {
    find_in(conn, id)
        .await?
        .ok_or_else(|| CoreError::record_not_found("Product", id).into())
}
