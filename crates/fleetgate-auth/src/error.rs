//! Authentication error types
//!
//! Every failure path in the auth core ends up here. Errors are designed to be:
//! - Specific in `Display` output (for logs and audit trails)
//! - Uniform in client output where specificity would leak (token checks)
//! - Convertible to HTTP status codes for the API layer

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for authentication operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication error types
#[derive(Debug, Error)]
pub enum AuthError {
    // =========================================================================
    // Token Errors
    // =========================================================================
    /// Token is not three dot-separated segments
    #[error("invalid token structure")]
    InvalidTokenStructure,

    /// Token payload or header could not be decoded
    #[error("invalid token format")]
    InvalidTokenFormat,

    /// Recomputed signature does not match
    #[error("invalid signature")]
    InvalidSignature,

    /// Token `exp` is in the past
    #[error("token expired")]
    TokenExpired,

    /// Token `iss` or `aud` does not match this service
    #[error("invalid issuer/audience")]
    InvalidIssuerOrAudience,

    /// Token type mismatch (expected access, got refresh, etc.)
    #[error("invalid token type")]
    InvalidTokenType,

    // =========================================================================
    // Credential Errors
    // =========================================================================
    /// Invalid credentials (email/password). Never says which one.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Email is already registered
    #[error("email already registered")]
    EmailAlreadyExists,

    /// Password reset token unknown, used, or expired
    #[error("invalid reset token")]
    InvalidResetToken,

    // =========================================================================
    // Password Errors
    // =========================================================================
    /// Password does not meet requirements
    #[error("password does not meet requirements: {0}")]
    WeakPassword(String),

    /// Password hashing failed
    #[error("password hashing failed")]
    PasswordHashingFailed,

    // =========================================================================
    // 2FA Errors
    // =========================================================================
    /// Submitted TOTP code matched none of the accepted time steps
    #[error("invalid 2FA code")]
    InvalidTwoFactorCode,

    /// Backup code was never issued or was already consumed
    #[error("invalid backup code")]
    InvalidBackupCode,

    /// No enrollment exists for the user
    #[error("no 2FA secret key found")]
    TwoFactorSecretMissing,

    /// 2FA is not enabled for this account
    #[error("2FA not enabled")]
    TwoFactorNotEnabled,

    /// 2FA is already enabled
    #[error("2FA already enabled")]
    TwoFactorAlreadyEnabled,

    /// Login is still waiting on its second factor
    #[error("two-factor verification required")]
    TwoFactorRequired,

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Session not found
    #[error("session not found")]
    SessionNotFound,

    /// Session passed its idle or absolute expiry
    #[error("session expired")]
    SessionExpired,

    /// Per-user session limit reached and no session could be evicted
    #[error("too many concurrent sessions")]
    TooManySessions,

    // =========================================================================
    // Authorization Errors
    // =========================================================================
    /// Caller's role is below the required role
    #[error("insufficient role")]
    InsufficientRole,

    /// Caller lacks a required permission
    #[error("insufficient permissions")]
    InsufficientPermissions,

    /// Caller is not the creator of the resource
    #[error("not resource owner")]
    NotResourceOwner,

    // =========================================================================
    // Role Catalog Errors
    // =========================================================================
    /// Role code is not in the catalog
    #[error("role not found: {0}")]
    RoleNotFound(String),

    /// Role code already exists
    #[error("role already exists: {0}")]
    RoleAlreadyExists(String),

    /// Operation is not allowed on a protected role
    #[error("role is protected: {0}")]
    ProtectedRole(String),

    /// Role references a permission code that is not in the catalog
    #[error("unknown permission: {0}")]
    UnknownPermission(String),

    /// Role definition is malformed
    #[error("invalid role: {0}")]
    InvalidRole(String),

    // =========================================================================
    // User State Errors
    // =========================================================================
    /// User account is disabled
    #[error("account is disabled")]
    AccountDisabled,

    /// User not found
    #[error("user not found")]
    UserNotFound,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Session snapshot or secret store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Store call exceeded its deadline
    #[error("store operation timed out")]
    StoreTimeout,

    /// Cryptographic operation failed
    #[error("cryptographic error")]
    Crypto,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error (should not be exposed to clients)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::WeakPassword(_)
            | Self::InvalidTokenType
            | Self::InvalidRole(_)
            | Self::UnknownPermission(_) => 400,

            // 401 Unauthorized
            Self::InvalidTokenStructure
            | Self::InvalidTokenFormat
            | Self::InvalidSignature
            | Self::TokenExpired
            | Self::InvalidIssuerOrAudience
            | Self::InvalidCredentials
            | Self::InvalidResetToken
            | Self::SessionNotFound
            | Self::SessionExpired => 401,

            // 403 Forbidden
            Self::InvalidTwoFactorCode
            | Self::InvalidBackupCode
            | Self::InsufficientRole
            | Self::InsufficientPermissions
            | Self::NotResourceOwner
            | Self::ProtectedRole(_)
            | Self::TwoFactorRequired
            | Self::AccountDisabled => 403,

            // 404 Not Found
            Self::UserNotFound
            | Self::RoleNotFound(_)
            | Self::TwoFactorSecretMissing
            | Self::TwoFactorNotEnabled => 404,

            // 409 Conflict
            Self::EmailAlreadyExists
            | Self::TwoFactorAlreadyEnabled
            | Self::RoleAlreadyExists(_)
            | Self::TooManySessions => 409,

            // 503 Service Unavailable
            Self::StoreTimeout => 503,

            // 500 Internal Server Error
            Self::Storage(_)
            | Self::Crypto
            | Self::PasswordHashingFailed
            | Self::Config(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Get an error code for the client (safe to expose)
    pub fn error_code(&self) -> &'static str {
        match self {
            // All token failures share one code so clients cannot probe which check failed
            Self::InvalidTokenStructure
            | Self::InvalidTokenFormat
            | Self::InvalidSignature
            | Self::TokenExpired
            | Self::InvalidIssuerOrAudience
            | Self::InvalidTokenType => "INVALID_TOKEN",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::EmailAlreadyExists => "EMAIL_ALREADY_EXISTS",
            Self::InvalidResetToken => "INVALID_RESET_TOKEN",
            Self::WeakPassword(_) => "WEAK_PASSWORD",
            Self::PasswordHashingFailed => "INTERNAL_ERROR",
            Self::InvalidTwoFactorCode => "INVALID_2FA_CODE",
            Self::InvalidBackupCode => "INVALID_BACKUP_CODE",
            Self::TwoFactorSecretMissing => "2FA_SECRET_MISSING",
            Self::TwoFactorNotEnabled => "2FA_NOT_ENABLED",
            Self::TwoFactorAlreadyEnabled => "2FA_ALREADY_ENABLED",
            Self::TwoFactorRequired => "2FA_REQUIRED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::TooManySessions => "TOO_MANY_SESSIONS",
            Self::InsufficientRole => "INSUFFICIENT_ROLE",
            Self::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            Self::NotResourceOwner => "NOT_RESOURCE_OWNER",
            Self::RoleNotFound(_) => "ROLE_NOT_FOUND",
            Self::RoleAlreadyExists(_) => "ROLE_ALREADY_EXISTS",
            Self::ProtectedRole(_) => "PROTECTED_ROLE",
            Self::UnknownPermission(_) => "UNKNOWN_PERMISSION",
            Self::InvalidRole(_) => "INVALID_ROLE",
            Self::AccountDisabled => "ACCOUNT_DISABLED",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::StoreTimeout => "SERVICE_UNAVAILABLE",
            Self::Storage(_) | Self::Crypto | Self::Config(_) | Self::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Stable, lowercase reason string (matches `Display` for fieldless variants)
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Whether this is one of the token verification failures
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTokenStructure
                | Self::InvalidTokenFormat
                | Self::InvalidSignature
                | Self::TokenExpired
                | Self::InvalidIssuerOrAudience
                | Self::InvalidTokenType
        )
    }

    /// Whether this is a session lifecycle failure
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound | Self::SessionExpired | Self::TooManySessions
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// Get safe message for client (doesn't leak internal details)
    pub fn client_message(&self) -> String {
        match self {
            _ if self.is_token_error() => "Invalid token".to_string(),
            Self::Storage(_)
            | Self::Internal(_)
            | Self::Config(_)
            | Self::Crypto
            | Self::PasswordHashingFailed => "An internal error occurred".to_string(),
            Self::StoreTimeout => "Service temporarily unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Error response for API clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code (machine-readable)
    pub code: String,
    /// Error message (human-readable)
    pub message: String,
}

impl From<&AuthError> for ErrorResponse {
    fn from(error: &AuthError) -> Self {
        Self {
            code: error.error_code().to_string(),
            message: error.client_message(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidToken => Self::InvalidTokenStructure,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => Self::InvalidSignature,
            ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => Self::TokenExpired,
            ErrorKind::InvalidIssuer | ErrorKind::InvalidAudience => Self::InvalidIssuerOrAudience,
            ErrorKind::InvalidKeyFormat => Self::Crypto,
            _ => Self::InvalidTokenFormat,
        }
    }
}

impl From<argon2::password_hash::Error> for AuthError {
    fn from(_: argon2::password_hash::Error) -> Self {
        Self::PasswordHashingFailed
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for AuthError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AuthError::InvalidCredentials.status_code(), 401);
        assert_eq!(AuthError::InsufficientRole.status_code(), 403);
        assert_eq!(AuthError::TwoFactorRequired.status_code(), 403);
        assert_eq!(AuthError::TwoFactorRequired.error_code(), "2FA_REQUIRED");
        assert_eq!(AuthError::UserNotFound.status_code(), 404);
        assert_eq!(AuthError::TooManySessions.status_code(), 409);
        assert_eq!(AuthError::StoreTimeout.status_code(), 503);
        assert_eq!(AuthError::Storage("disk".to_string()).status_code(), 500);
    }

    #[test]
    fn test_reason_strings_are_stable() {
        assert_eq!(AuthError::InvalidTokenStructure.reason(), "invalid token structure");
        assert_eq!(AuthError::InvalidSignature.reason(), "invalid signature");
        assert_eq!(AuthError::TokenExpired.reason(), "token expired");
        assert_eq!(AuthError::InvalidIssuerOrAudience.reason(), "invalid issuer/audience");
        assert_eq!(AuthError::TwoFactorSecretMissing.reason(), "no 2FA secret key found");
        assert_eq!(AuthError::InvalidBackupCode.reason(), "invalid backup code");
        assert_eq!(AuthError::TooManySessions.reason(), "too many concurrent sessions");
    }

    #[test]
    fn test_token_errors_are_indistinguishable_to_clients() {
        let errors = [
            AuthError::InvalidTokenStructure,
            AuthError::InvalidSignature,
            AuthError::TokenExpired,
            AuthError::InvalidIssuerOrAudience,
        ];
        for err in &errors {
            let response = ErrorResponse::from(err);
            assert_eq!(response.code, "INVALID_TOKEN");
            assert_eq!(response.message, "Invalid token");
            assert_eq!(err.status_code(), 401);
        }
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let err = AuthError::Storage("/var/lib/fleetgate/sessions: permission denied".to_string());
        assert!(!err.client_message().contains("/var/lib"));
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_error_classification() {
        assert!(AuthError::TokenExpired.is_token_error());
        assert!(!AuthError::SessionExpired.is_token_error());
        assert!(AuthError::SessionExpired.is_session_error());
        assert!(AuthError::Internal("x".to_string()).is_server_error());
    }
}
