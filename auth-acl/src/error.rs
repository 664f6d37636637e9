use thiserror::Error;

#[derive(Error, Debug)]
pub enum AclError {
    /// A lookup by id, name or email matched zero rows.
    #[error("No {entity} with {key} = {value}")]
    NotFound {
        entity: &'static str,
        key: &'static str,
        value: String,
    },

    /// A lookup by a non-unique key matched more than one row.
    #[error("{count} {entity} records share {key} = {value}")]
    Ambiguous {
        entity: &'static str,
        key: &'static str,
        value: String,
        count: usize,
    },

    #[error("Storage error: {0}")]
    StorageError(String),

    /// A relation points at an entity that no longer exists.
    #[error("Dangling reference to {entity} {id}")]
    DanglingReference { entity: &'static str, id: i64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl AclError {
    pub fn not_found(entity: &'static str, key: &'static str, value: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key,
            value: value.to_string(),
        }
    }

    pub fn ambiguous(
        entity: &'static str,
        key: &'static str,
        value: impl ToString,
        count: usize,
    ) -> Self {
        Self::Ambiguous {
            entity,
            key,
            value: value.to_string(),
            count,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Errors a caller can branch on in a normal flow. Storage and internal
    /// failures are not recoverable and must end in a denial.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Ambiguous { .. } | Self::DanglingReference { .. }
        )
    }
}

impl From<sqlx::Error> for AclError {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageError(err.to_string())
    }
}

impl From<config::ConfigError> for AclError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AclError>;
