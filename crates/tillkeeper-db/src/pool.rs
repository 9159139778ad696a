//! # Database Pool Management
//!
//! Connection pool, lock timeouts and the collaborators every coordinator
//! shares.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Database Handle                                    │
//! │                                                                         │
//! │  DbConfig::new(path).lock_timeout(3s)                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await   ← pool + busy_timeout + migrations      │
//! │       │                                                                 │
//! │       ├── .with_cache(Arc<dyn CacheInvalidator>)                       │
//! │       └── .with_labels(LabelQueue)                                     │
//! │                                                                         │
//! │  db.units()         UnitRegistry                                        │
//! │  db.stock()         StockLedger                                         │
//! │  db.products()      ProductRepository                                   │
//! │  db.carts()         ReservationCoordinator                              │
//! │  db.invoices()      SettlementCoordinator                               │
//! │  db.replacements()  ReplacementCoordinator                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Bounded Waits
//! `lock_timeout` is used both as SQLite's `busy_timeout` and as the pool's
//! acquire timeout. A caller that cannot get the writer lock or a
//! connection in time gets `CoreError::Busy`.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use tillkeeper_core::{AuditRecord, SYSTEM_ACTOR};

use crate::audit::AuditLog;
use crate::cache::{CacheInvalidator, InvalidationBatch, NoopInvalidator};
use crate::config::InventorySettings;
use crate::coordinator::replacement::ReplacementCoordinator;
use crate::coordinator::reservation::ReservationCoordinator;
use crate::coordinator::settlement::SettlementCoordinator;
use crate::error::{DbError, DbResult};
use crate::labels::LabelQueue;
use crate::migrations;
use crate::repository::product::ProductRepository;
use crate::repository::stock::StockLedger;
use crate::repository::unit::UnitRegistry;

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/tillkeeper/tillkeeper.db")
///     .max_connections(5)
///     .lock_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Default: 5
    pub max_connections: u32,

    /// Default: 1
    pub min_connections: u32,

    /// Time allowed to open a new connection. Default: 30 seconds
    pub connect_timeout: Duration,

    /// Default: 10 minutes
    pub idle_timeout: Duration,

    /// Longest wait for the writer lock or a pooled connection.
    /// Default: 3 seconds
    pub lock_timeout: Duration,

    /// Default: true
    pub run_migrations: bool,

    /// Coordinator settings.
    pub inventory: InventorySettings,

    /// Audit actor.
    pub actor: String,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            lock_timeout: Duration::from_secs(3),
            run_migrations: true,
            inventory: InventorySettings::default(),
            actor: SYSTEM_ACTOR.to_string(),
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    pub fn inventory(mut self, settings: InventorySettings) -> Self {
        self.inventory = settings;
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// In-memory database for tests. One connection, so concurrent callers
    /// queue on the pool and still see the lock timeout.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            lock_timeout: Duration::from_secs(5),
            run_migrations: true,
            inventory: InventorySettings::default(),
            actor: SYSTEM_ACTOR.to_string(),
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == ":memory:"
    }
}

// =============================================================================
// Shared Context
// =============================================================================

/// What every repository and coordinator carries besides the pool.
#[derive(Debug, Clone)]
pub struct Hooks {
    pub cache: Arc<dyn CacheInvalidator>,
    pub labels: LabelQueue,
    pub audit: AuditLog,
    pub settings: Arc<InventorySettings>,
}

impl Hooks {
    /// Flushes `batch` after a commit. Both the per-call switch and the
    /// configured `notify_cache` must be on.
    pub(crate) fn flush_if(&self, batch: InvalidationBatch, notify: bool) {
        batch.flush(self.cache.as_ref(), notify && self.settings.notify_cache);
    }
}

/// Opens a transaction that already holds SQLite's writer lock.
///
/// The first statement is a write, so the lock is requested before any read
/// snapshot exists and `busy_timeout` governs the wait. Reads inside the
/// transaction then see state no other writer can change until commit.
pub(crate) async fn begin_write(pool: &SqlitePool) -> DbResult<Transaction<'static, Sqlite>> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE write_guard SET generation = generation + 1 WHERE id = 1")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

// =============================================================================
// Database
// =============================================================================

/// Main database handle.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    hooks: Hooks,
}

impl Database {
    /// Creates the pool, configures SQLite and runs migrations.
    ///
    /// - WAL journal, NORMAL synchronous, foreign keys on
    /// - `busy_timeout` and pool acquire timeout set to `lock_timeout`
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            lock_timeout_ms = config.lock_timeout.as_millis() as u64,
            "Initializing database connection"
        );

        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());

        let mut connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.lock_timeout)
            .create_if_missing(true);

        if !config.is_in_memory() {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.lock_timeout.max(Duration::from_millis(1)))
            .idle_timeout(Some(config.idle_timeout));

        if config.is_in_memory() {
            // Closing the only connection would drop the database
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(max_connections = config.max_connections, "Database pool created");

        let hooks = Hooks {
            cache: Arc::new(NoopInvalidator),
            labels: LabelQueue::disabled(),
            audit: AuditLog::new(config.actor.clone()),
            settings: Arc::new(config.inventory.clone()),
        };

        let db = Database { pool, hooks };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Replaces the cache invalidator.
    pub fn with_cache(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.hooks.cache = cache;
        self
    }

    /// Replaces the label queue.
    pub fn with_labels(mut self, labels: LabelQueue) -> Self {
        self.hooks.labels = labels;
        self
    }

    pub async fn run_migrations(&self) -> DbResult<()> {
        info!("Running database migrations");
        migrations::run_migrations(&self.pool).await?;
        info!("Migrations complete");
        Ok(())
    }

    /// (total, applied) migration counts.
    pub async fn migration_status(&self) -> DbResult<(usize, usize)> {
        migrations::migration_status(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn settings(&self) -> &InventorySettings {
        &self.hooks.settings
    }

    pub fn products(&self) -> ProductRepository {
        ProductRepository::new(self.pool.clone())
    }

    pub fn units(&self) -> UnitRegistry {
        UnitRegistry::new(self.pool.clone(), self.hooks.clone())
    }

    pub fn stock(&self) -> StockLedger {
        StockLedger::new(self.pool.clone(), self.hooks.clone())
    }

    pub fn carts(&self) -> ReservationCoordinator {
        ReservationCoordinator::new(self.pool.clone(), self.hooks.clone())
    }

    pub fn invoices(&self) -> SettlementCoordinator {
        SettlementCoordinator::new(self.pool.clone(), self.hooks.clone())
    }

    pub fn replacements(&self) -> ReplacementCoordinator {
        ReplacementCoordinator::new(self.pool.clone(), self.hooks.clone())
    }

    /// Audit rows for one entity, oldest first.
    pub async fn audit_history(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> DbResult<Vec<AuditRecord>> {
        let mut conn = self.pool.acquire().await?;
        AuditLog::history(&mut conn, entity_type, entity_id).await
    }

    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Whether the database answers a trivial query.
    pub async fn health_check(&self) -> bool {
        let ok = sqlx::query("SELECT 1").execute(&self.pool).await.is_ok();
        debug!(ok, "Database health check");
        ok
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);

        let (total, applied) = db.migration_status().await.unwrap();
        assert_eq!(total, applied);
        assert!(total >= 1);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/test.db")
            .max_connections(10)
            .min_connections(2)
            .lock_timeout(Duration::from_millis(250))
            .actor("till-07");

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.actor, "till-07");
        assert!(!config.is_in_memory());
        assert!(DbConfig::in_memory().is_in_memory());
    }

    #[tokio::test]
    async fn test_begin_write_takes_lock_and_rolls_back() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        {
            let _tx = begin_write(db.pool()).await.unwrap();
            // dropped without commit
        }
        let generation: i64 = sqlx::query_scalar("SELECT generation FROM write_guard WHERE id = 1")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(generation, 0);
    }
}
