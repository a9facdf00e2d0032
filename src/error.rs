use std::fmt::Display;

/// Engine error taxonomy.
///
/// `NotFound` carries no payload. An absent record, a soft-deleted record, a
/// record owned by another tenant and an unowned nested child all surface
/// identically.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Validation(String),
    NotFound,
    OperationNotAllowed {
        relation: String,
        operation: &'static str,
    },
    Conflict(String),
    Serialize(String),
    Deserialize(String),
    Storage(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// HTTP status the transport layer should answer with.
    pub fn status(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::OperationNotAllowed { .. } => 400,
            Error::NotFound => 404,
            Error::Conflict(_) => 409,
            Error::Serialize(_) | Error::Deserialize(_) | Error::Storage(_) => 500,
        }
    }

    /// Stable machine-readable code, used in per-item batch results.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound => "NOT_FOUND",
            Error::OperationNotAllowed { .. } => "OPERATION_NOT_ALLOWED",
            Error::Conflict(_) => "CONFLICT",
            Error::Serialize(_) | Error::Deserialize(_) | Error::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Validation(err) => write!(f, "Validation error: {}", err),
            Error::NotFound => write!(f, "Not found"),
            Error::OperationNotAllowed {
                relation,
                operation,
            } => write!(
                f,
                "Operation '{}' is not allowed on relation '{}'",
                operation, relation
            ),
            Error::Conflict(err) => write!(f, "Conflict: {}", err),
            Error::Serialize(err) => write!(f, "Serialization error: {}", err),
            Error::Deserialize(err) => write!(f, "Deserialization error: {}", err),
            Error::Storage(err) => write!(f, "Storage error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Deserialize(err.to_string())
    }
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
