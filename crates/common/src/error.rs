use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Exchange API error: {0}")]
    Exchange(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("unique constraint violated")]
    UniqueViolation,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Strategy error: {0}")]
    Sandbox(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Unique-constraint failures get their own variant so the paper broker can
/// turn "position already open" into a no-op instead of a failed run.
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.is_unique_violation() {
                return Error::UniqueViolation;
            }
        }
        Error::Database(e)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
