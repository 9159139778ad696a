//! # Database Error Types
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  sqlx::Error ──┬── PoolTimedOut / SQLITE_BUSY / SQLITE_LOCKED           │
//! │                │        └──► DbError::Domain(CoreError::Busy)          │
//! │                └── anything else ──► DbError::{Query, Unique, ...}      │
//! │                                                                         │
//! │  CoreError (grammar, claims, stock) ──► DbError::Domain                 │
//! │                                                                         │
//! │  API layer matches on DbError::Domain(e) and uses e.kind()             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;
use tillkeeper_core::{CoreError, ErrorKind, ValidationError};

/// SQLite primary result codes for lock contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Inventory outcome the caller must act on (claim lost, bad tag, ...).
    #[error(transparent)]
    Domain(#[from] CoreError),

    /// Unique constraint violation.
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// Database connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Configuration could not be read, parsed or written.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// The domain error, if this is one.
    pub fn as_domain(&self) -> Option<&CoreError> {
        match self {
            DbError::Domain(e) => Some(e),
            _ => None,
        }
    }

    /// Machine-readable kind for domain errors.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.as_domain().map(CoreError::kind)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, DbError::Domain(CoreError::Busy { .. }))
    }

    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl From<ValidationError> for DbError {
    fn from(err: ValidationError) -> Self {
        DbError::Domain(CoreError::Validation(err))
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// PoolTimedOut                 → Domain(Busy)   (bounded wait exceeded)
/// Database, code 5 or 6        → Domain(Busy)   (busy_timeout exceeded)
/// Database, UNIQUE             → UniqueViolation
/// Database, FOREIGN KEY        → ForeignKeyViolation
/// RowNotFound                  → Domain(RecordNotFound)
/// PoolClosed                   → ConnectionFailed
/// Other                        → Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                DbError::Domain(CoreError::record_not_found("Record", "unknown"))
            }

            sqlx::Error::Database(db_err) => {
                let primary_code = db_err
                    .code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map(|c| c & 0xff);
                if matches!(primary_code, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
                    return DbError::Domain(CoreError::busy("database"));
                }

                let msg = db_err.message();
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::Domain(CoreError::busy("connection pool")),

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
