/// Errors that can occur within the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found in the database.
    #[error("storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: i64 },

    /// The generic query surface was asked about a table it does not know.
    #[error("storage: unknown table '{0}'")]
    UnknownTable(String),

    /// A filter referenced a column that does not exist on the table.
    #[error("storage: unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// The status column held a value outside the closed status set.
    #[error("storage: invalid status code {0}")]
    InvalidStatus(i16),

    /// An underlying database error.
    #[error("storage: database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    /// JSON serialization or deserialization failure (entities column).
    #[error("storage: json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
