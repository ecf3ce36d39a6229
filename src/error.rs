//! Error types for kiro-gateway.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for kiro-gateway.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ───────────────────────────────────────────────────────
    /// Token refresh failed.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Missing required credential field.
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    /// All retry attempts exhausted.
    #[error("Request failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Description of the last error.
        message: String,
    },

    // ── Storage ──────────────────────────────────────────────────────────────
    /// Storage I/O error.
    #[error("Storage I/O error at {path}: {message}")]
    StorageIo {
        /// Path that caused the error.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// Storage serialization error.
    #[error("Storage serialization error: {0}")]
    StorageSerialization(String),

    /// Generic storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    // ── Infrastructure ───────────────────────────────────────────────────────
    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request timeout.
    #[error("Request timed out")]
    Timeout,

    // ── Credential lifecycle (multi-account) ───────────────────────────────────
    /// C3 pre-flight: the record has no refresh token to work with.
    #[error("Record {id} has no refresh token")]
    MissingRefreshToken {
        /// Credential record id.
        id: i64,
    },

    /// C3 pre-flight: device-code refresh needs both client_id and client_secret.
    #[error("Record {id} is missing client_id/client_secret required for device-code refresh")]
    MissingClientCredentials {
        /// Credential record id.
        id: i64,
    },

    /// C3: upstream 401 on refresh. The record is left untouched; it needs re-auth.
    #[error("Refresh token for record {id} was rejected by upstream (expired or revoked)")]
    RefreshTokenExpired {
        /// Credential record id.
        id: i64,
    },

    /// C3: non-401 HTTP failure talking to a refresh endpoint. Caller may retry.
    #[error("Refresh transport error for record {id}: HTTP {status}: {message}")]
    RefreshTransportError {
        /// Credential record id.
        id: i64,
        /// HTTP status code, if the upstream responded at all.
        status: u16,
        /// Error or response body text.
        message: String,
    },

    /// C3/C4: a 200 response was missing a mandatory field (e.g. `accessToken`).
    #[error("Malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),

    // ── OAuth acquisition (C4) ───────────────────────────────────────────────────
    /// PKCE callback's `state` parameter did not match the one generated for the flow.
    #[error("OAuth callback state mismatch")]
    OAuthStateMismatch,

    /// PKCE callback carried an `error=` query parameter from the identity provider.
    #[error("OAuth provider returned an error: {0}")]
    OAuthProviderError(String),

    /// Device-code poll loop: `error=expired_token`.
    #[error("Device code expired before the user completed authorization")]
    DeviceCodeExpired,

    /// Device-code poll loop: `error=access_denied`.
    #[error("User denied the authorization request")]
    UserDenied,

    // ── Request-time auth resolution (C6) ────────────────────────────────────────
    /// C6: no usable credential for this request (missing/invalid bearer, cache
    /// validation failure, or no configured fallback). Surfaced as downstream 401.
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    // ── Upstream client (C7) ─────────────────────────────────────────────────────
    /// C7: a non-retryable HTTP error from the upstream generation endpoint.
    #[error("Upstream error {status}: {message}")]
    UpstreamHttpError {
        /// HTTP status code returned by the upstream.
        status: u16,
        /// Extracted error message, if any.
        message: String,
    },

    // ── Stream transcoder (C8) ───────────────────────────────────────────────────
    /// C8: the first-token watchdog exhausted its retry budget without seeing a byte.
    #[error("No response from upstream within the first-token timeout after {attempts} attempt(s)")]
    FirstTokenTimeout {
        /// Total attempts made, including the first.
        attempts: u32,
    },
}

impl Error {
    /// Returns true if this error indicates re-authentication is needed.
    #[must_use]
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Error::RefreshFailed(_)
                | Error::RefreshTokenExpired { .. }
                | Error::AuthenticationError(_)
                | Error::UpstreamHttpError { status: 401, .. }
                | Error::UpstreamHttpError { status: 403, .. }
        )
    }

    /// Creates a storage I/O error.
    #[must_use]
    pub fn storage_io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::StorageIo {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Convenience type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_reauth() {
        assert!(Error::RefreshFailed("test".into()).requires_reauth());
        assert!(Error::RefreshTokenExpired { id: 1 }.requires_reauth());
        assert!(Error::UpstreamHttpError { status: 403, message: "Forbidden".into() }.requires_reauth());

        assert!(!Error::UpstreamHttpError { status: 500, message: "Server error".into() }.requires_reauth());
        assert!(!Error::Timeout.requires_reauth());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UpstreamHttpError { status: 429, message: "Too many requests".into() };
        assert_eq!(err.to_string(), "Upstream error 429: Too many requests");
    }
}
