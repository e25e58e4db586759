//! Core authentication types
//!
//! Shared types used across all authentication components. `Session` is also
//! the persisted snapshot contract, so its serde shape is stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// User Types
// =============================================================================

/// User record as held by the external user store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    /// Argon2id PHC string
    pub password_hash: String,
    /// Role code from the role catalog
    pub role: String,
    /// Disabled accounts cannot log in
    pub active: bool,
    pub two_factor_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Fields needed to create a user
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub password_hash: String,
    pub role: String,
}

/// Partial update of a user record; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub name: Option<String>,
    pub password_hash: Option<String>,
    pub role: Option<String>,
    pub active: Option<bool>,
    pub two_factor_enabled: Option<bool>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Basic user info for responses (no credential material)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub two_factor_enabled: bool,
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role.clone(),
            two_factor_enabled: user.two_factor_enabled,
        }
    }
}

// =============================================================================
// Token Types
// =============================================================================

/// Token kind, carried in the `type` claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Caller-supplied claims, before the service stamps time and audience
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSet {
    pub user_id: Uuid,
    pub role: String,
    pub permissions: Vec<String>,
    pub session_id: Option<String>,
    /// False while the login still waits on its second factor
    pub two_factor_verified: bool,
}

/// Signed token payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Role code
    pub role: String,
    /// Permission snapshot
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Session ID
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sid: Option<String>,
    /// Token kind
    #[serde(rename = "type")]
    pub token_type: TokenKind,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Token ID
    pub jti: String,
    /// Second factor completed; absent means not verified
    #[serde(default)]
    pub two_factor_verified: bool,
}

impl TokenClaims {
    /// Strip the service-stamped claims, leaving what the caller supplied
    pub fn claim_set(&self) -> Option<ClaimSet> {
        let user_id = Uuid::parse_str(&self.sub).ok()?;
        Some(ClaimSet {
            user_id,
            role: self.role.clone(),
            permissions: self.permissions.clone(),
            session_id: self.sid.clone(),
            two_factor_verified: self.two_factor_verified,
        })
    }
}

/// Access + refresh token pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry (Unix timestamp)
    pub access_expires_at: i64,
    /// Refresh token expiry (Unix timestamp)
    pub refresh_expires_at: i64,
    /// Always "Bearer"
    pub token_type: String,
}

impl TokenPair {
    pub fn new(
        access_token: String,
        refresh_token: String,
        access_expires_at: i64,
        refresh_expires_at: i64,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
            token_type: "Bearer".to_string(),
        }
    }
}

// =============================================================================
// Session Types
// =============================================================================

/// Device metadata captured at login; opaque to the session manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub platform: Option<String>,
    /// Stable device identifier (fingerprint or client-assigned)
    pub device_id: Option<String>,
    /// ISO country code, if geolocated
    pub location: Option<String>,
}

impl DeviceInfo {
    /// Build device info from a user agent, detecting the platform
    pub fn from_user_agent(user_agent: &str, ip_address: Option<&str>) -> Self {
        Self {
            user_agent: Some(user_agent.to_string()),
            ip_address: ip_address.map(str::to_string),
            platform: detect_platform(user_agent),
            device_id: None,
            location: None,
        }
    }
}

fn detect_platform(ua: &str) -> Option<String> {
    // Android before Linux: Android UAs contain "Linux"
    let platform = if ua.contains("Android") {
        "Android"
    } else if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iOS") {
        "iOS"
    } else if ua.contains("Windows") {
        "Windows"
    } else if ua.contains("Mac OS") {
        "macOS"
    } else if ua.contains("Linux") {
        "Linux"
    } else {
        return None;
    };
    Some(platform.to_string())
}

/// Who a session is being created for
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub user_id: Uuid,
    pub role: String,
    pub permissions: Vec<String>,
    /// False while a required second factor is outstanding
    pub two_factor_verified: bool,
}

/// Lifecycle state of a session at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    IdleExpired,
    AbsoluteExpired,
}

/// Session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque, unguessable session id
    pub id: String,
    pub user_id: Uuid,
    pub user_role: String,
    /// Permission snapshot taken at creation
    pub user_permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Rolling idle expiry
    pub idle_expires_at: DateTime<Utc>,
    pub device_info: DeviceInfo,
    pub access_token: String,
    pub refresh_token: String,
    /// Whether the login's second factor has been completed; absent means not
    #[serde(default)]
    pub two_factor_verified: bool,
}

impl Session {
    /// Status at `now`; absolute expiry wins over idle expiry
    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        if now >= self.expires_at {
            SessionStatus::AbsoluteExpired
        } else if now >= self.idle_expires_at {
            SessionStatus::IdleExpired
        } else {
            SessionStatus::Active
        }
    }

    /// Whether both expiries are still in the future
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == SessionStatus::Active
    }

    /// Age of the session in whole seconds
    pub fn duration_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }
}

// =============================================================================
// 2FA Types
// =============================================================================

/// Result of starting 2FA enrollment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpEnrollment {
    /// Secret key (base32 encoded)
    pub secret: String,
    /// Provisioning URL (otpauth://)
    pub qr_code_url: String,
}

/// Stored 2FA state for one user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwoFactorRecord {
    /// Base32 secret
    pub secret: String,
    pub enabled: bool,
    /// SHA-256 hashes of unused backup codes
    pub backup_code_hashes: Vec<String>,
}

// =============================================================================
// Login/Auth Request Types
// =============================================================================

/// Login request
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// TOTP or backup code, if the caller already has one
    #[serde(default)]
    pub two_factor_code: Option<String>,
}

/// Successful login
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    pub user: UserInfo,
    pub session: Session,
    pub tokens: TokenPair,
    /// The caller must still complete 2FA before protected access
    pub two_factor_required: bool,
}

/// Registration request
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Logout response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub success: bool,
}

/// Password reset token to hand to the delivery channel
#[derive(Debug, Clone)]
pub struct PasswordResetTicket {
    pub user_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session_at(now: DateTime<Utc>) -> Session {
        Session {
            id: "s1".to_string(),
            user_id: Uuid::new_v4(),
            user_role: "operator".to_string(),
            user_permissions: vec!["read:shipments".to_string()],
            created_at: now,
            last_activity: now,
            expires_at: now + Duration::hours(24),
            idle_expires_at: now + Duration::minutes(30),
            device_info: DeviceInfo::default(),
            access_token: String::new(),
            refresh_token: String::new(),
            two_factor_verified: true,
        }
    }

    #[test]
    fn test_session_status_transitions() {
        let now = Utc::now();
        let session = session_at(now);

        assert_eq!(session.status(now), SessionStatus::Active);
        assert_eq!(session.status(now + Duration::minutes(31)), SessionStatus::IdleExpired);
        assert_eq!(session.status(now + Duration::hours(25)), SessionStatus::AbsoluteExpired);
    }

    #[test]
    fn test_session_snapshot_round_trip() {
        let session = session_at(Utc::now());
        let json = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(session, restored);
    }

    #[test]
    fn test_snapshot_without_two_factor_flag_is_unverified() {
        let mut json = serde_json::to_value(session_at(Utc::now())).unwrap();
        json.as_object_mut().unwrap().remove("two_factor_verified");

        let restored: Session = serde_json::from_value(json).unwrap();
        assert!(!restored.two_factor_verified);
    }

    #[test]
    fn test_token_kind_wire_name() {
        assert_eq!(serde_json::to_string(&TokenKind::Refresh).unwrap(), "\"refresh\"");
    }

    #[test]
    fn test_device_info_platform_detection() {
        let ua = "Mozilla/5.0 (Linux; Android 11; Pixel 5) AppleWebKit/537.36 \
                  Chrome/91.0 Mobile Safari/537.36";
        let info = DeviceInfo::from_user_agent(ua, Some("10.0.0.7"));
        assert_eq!(info.platform.as_deref(), Some("Android"));
        assert_eq!(info.ip_address.as_deref(), Some("10.0.0.7"));

        let info = DeviceInfo::from_user_agent("curl/8.0", None);
        assert_eq!(info.platform, None);
    }
}
