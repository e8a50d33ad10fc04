use thiserror::Error;

/// Failures talking to the ERP backend.
#[derive(Debug, Error)]
pub enum ErpError {
    /// Transport failure or undecodable body
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Session cookie missing or expired
    #[error("ERP session missing or invalid")]
    Unauthorized,

    /// Non-success HTTP status
    #[error("HTTP {status} from {method}")]
    Status { status: u16, method: String },

    /// Record or configuration not found
    #[error("Not found: {entity} {key}")]
    NotFound { entity: String, key: String },

    /// Configuration record lacks a field its enabled technology needs
    #[error("Invalid transponder configuration {name}: {reason}")]
    InvalidConfiguration { name: String, reason: String },

    /// Create refused because a UID is already registered
    #[error("Transponder(s) already exist: {}", uids.join(", "))]
    AlreadyExists { uids: Vec<String> },

    /// Backend answered create with something other than the number
    #[error("Backend rejected transponder: {message}")]
    Rejected { message: String },

    /// Request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ErpError {
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    pub fn invalid_configuration(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<ErpError> for keycreator_core::Error {
    fn from(err: ErpError) -> Self {
        keycreator_core::Error::Erp(err.to_string())
    }
}

/// Specialized result type for ERP operations
pub type ErpResult<T> = Result<T, ErpError>;
