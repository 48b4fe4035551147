use thiserror::Error;

/// PostgREST code returned when a row-level security policy rejects a write
pub const PERMISSION_DENIED_CODE: &str = "42501";

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an API error, mapping the RLS code to `PermissionDenied`
    pub fn api(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        if code.as_deref() == Some(PERMISSION_DENIED_CODE) {
            return Error::PermissionDenied(message);
        }
        Error::Api { status, code, message }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Api { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// PostgREST error code, when the backend supplied one
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Api { code, .. } => code.as_deref(),
            Error::PermissionDenied(_) => Some(PERMISSION_DENIED_CODE),
            _ => None,
        }
    }
}
