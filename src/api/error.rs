use thiserror::Error;

use crate::auth::cookie_file::StoreError;
use crate::auth::totp::TotpError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - session was rejected by the console")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected redirect to {0}")]
    UnexpectedRedirect(String),

    #[error("Role named \"{0}\" already exists")]
    RoleAlreadyExists(String),

    #[error("Authentication failed after {0} sign-in attempts")]
    AuthenticationFailed(u32),

    #[error("Unexpected page structure: {0}")]
    MalformedPage(&'static str),

    #[error("Invalid console URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    CookieFile(#[from] StoreError),

    #[error(transparent)]
    Totp(#[from] TotpError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data. The console
    /// serves HTML error pages, so the cutoff must land on a char boundary.
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut cut = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..cut],
                body.len()
            )
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}
