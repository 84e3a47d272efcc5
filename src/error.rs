//! Error types for the catalog.

use thiserror::Error;

/// Result type for catalog operations
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Everything a catalog, schema, or ledger operation can fail with.
///
/// All variants except the storage ones describe a rejected request and leave
/// the database untouched.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Field already exists: {0}")]
    DuplicateField(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Invalid field name: {0:?} (use letters, digits and underscores, not starting with a digit)")]
    InvalidFieldName(String),

    #[error("Product not found: {0}")]
    NotFound(i64),

    #[error("Version entry not found: {0}")]
    UnknownEntry(i64),

    #[error("Field {field} of version entry {entry} no longer exists")]
    FieldNoLongerExists { entry: i64, field: String },

    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Field {0} is required")]
    MissingRequiredField(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
}

impl CatalogError {
    pub(crate) fn invalid_value(field: &str, reason: impl Into<String>) -> Self {
        CatalogError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
