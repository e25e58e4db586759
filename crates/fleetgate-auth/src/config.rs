//! FleetGate auth configuration
//!
//! Every section has working defaults except the token secret. Durations
//! (de)serialize as humantime strings ("30m", "24h") and every section is
//! `#[serde(default)]`, so a config file only lists what it overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AuthError, AuthResult};

/// OWASP floor for Argon2id memory, in KiB
pub const ARGON2_MIN_MEMORY_KIB: u32 = 19_456;
/// OWASP floor for Argon2id iterations
pub const ARGON2_MIN_ITERATIONS: u32 = 2;

const HOUR: u64 = 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: TokenConfig,
    pub session: SessionConfig,
    pub totp: TotpConfig,
    pub password: PasswordConfig,
    pub reset: ResetConfig,
}

/// Signing key and claims for dashboard tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HS256 key; empty means unconfigured
    pub secret: String,
    #[serde(with = "humantime_serde")]
    pub access_token_lifetime: Duration,
    /// Kept equal to the session lifetime by default
    #[serde(with = "humantime_serde")]
    pub refresh_token_lifetime: Duration,
    pub issuer: String,
    pub audience: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            access_token_lifetime: Duration::from_secs(HOUR),
            refresh_token_lifetime: Duration::from_secs(24 * HOUR),
            issuer: "fleetgate".to_string(),
            audience: "fleetgate-dashboard".to_string(),
        }
    }
}

/// Session lifecycle limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Random bytes per session id
    pub id_length: usize,
    /// Absolute lifetime from creation
    #[serde(with = "humantime_serde")]
    pub lifetime: Duration,
    /// Sliding inactivity window
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Access tokens this close to expiry are re-issued on activity
    #[serde(with = "humantime_serde")]
    pub refresh_threshold: Duration,
    pub max_sessions_per_user: usize,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Deadline applied to every snapshot store call
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id_length: 32,
            lifetime: Duration::from_secs(24 * HOUR),
            idle_timeout: Duration::from_secs(30 * 60),
            refresh_threshold: Duration::from_secs(5 * 60),
            max_sessions_per_user: 5,
            cleanup_interval: Duration::from_secs(60),
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// HMAC algorithm used for TOTP codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TotpAlgorithm {
    /// What every authenticator app supports
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl TotpAlgorithm {
    /// Name as it appears in otpauth:// URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }
}

/// Second-factor settings
///
/// The drift window is one step either side and is not configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TotpConfig {
    /// Label shown in the authenticator app
    pub issuer: String,
    /// 6 or 8
    pub digits: u32,
    /// Step length in seconds
    pub step: u64,
    pub algorithm: TotpAlgorithm,
    pub backup_codes_count: usize,
    /// Characters per backup code
    pub backup_code_length: usize,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: "FleetGate".to_string(),
            digits: 6,
            step: 30,
            algorithm: TotpAlgorithm::default(),
            backup_codes_count: 10,
            backup_code_length: 8,
        }
    }
}

/// Argon2id cost parameters and the password policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    /// KiB
    pub memory_cost: u32,
    /// Iterations
    pub time_cost: u32,
    pub parallelism: u32,
    /// Server-side secret mixed into every hash
    pub pepper: Option<String>,
    pub min_password_length: usize,
    /// Upper bound keeps hashing cost bounded
    pub max_password_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost: ARGON2_MIN_MEMORY_KIB,
            time_cost: ARGON2_MIN_ITERATIONS,
            parallelism: 1,
            pepper: None,
            min_password_length: 12,
            max_password_length: 128,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
        }
    }
}

/// Password reset tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// Random bytes per token
    pub token_length: usize,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(HOUR),
            token_length: 32,
        }
    }
}

impl AuthConfig {
    /// Defaults overridden by `FLEETGATE_*` environment variables
    ///
    /// Duration variables take humantime strings; an unparseable one is a
    /// `Config` error rather than a silent fallback.
    pub fn from_env() -> AuthResult<Self> {
        let mut config = Self::default();

        if let Some(secret) = env_string("FLEETGATE_TOKEN_SECRET") {
            config.token.secret = secret;
        }
        if let Some(issuer) = env_string("FLEETGATE_TOKEN_ISSUER") {
            config.token.issuer = issuer;
        }
        if let Some(audience) = env_string("FLEETGATE_TOKEN_AUDIENCE") {
            config.token.audience = audience;
        }
        if let Some(lifetime) = env_duration("FLEETGATE_ACCESS_TOKEN_LIFETIME")? {
            config.token.access_token_lifetime = lifetime;
        }
        if let Some(lifetime) = env_duration("FLEETGATE_SESSION_LIFETIME")? {
            config.session.lifetime = lifetime;
            config.token.refresh_token_lifetime = lifetime;
        }
        if let Some(idle) = env_duration("FLEETGATE_SESSION_IDLE_TIMEOUT")? {
            config.session.idle_timeout = idle;
        }
        if let Some(issuer) = env_string("FLEETGATE_TOTP_ISSUER") {
            config.totp.issuer = issuer;
        }
        if let Some(pepper) = env_string("FLEETGATE_PASSWORD_PEPPER") {
            config.password.pepper = Some(pepper);
        }

        Ok(config)
    }

    /// Every problem with this configuration, not just the first
    ///
    /// These are hard errors; [`AuthService::new`](crate::AuthService::new)
    /// refuses a configuration that fails here. Weak but workable settings
    /// are reported by [`advisories`](Self::advisories) instead.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        let mut check = |ok: bool, msg: &str| {
            if !ok {
                problems.push(msg.to_string());
            }
        };

        let secret_len = self.token.secret.len();
        check(secret_len > 0, "Token secret must be set");
        check(
            secret_len == 0 || secret_len >= 32,
            "Token secret should be at least 256 bits (32 bytes)",
        );
        check(
            self.session.refresh_threshold < self.token.access_token_lifetime,
            "Refresh threshold must be shorter than the access token lifetime",
        );

        check(
            self.session.idle_timeout <= self.session.lifetime,
            "Idle timeout must not exceed the session lifetime",
        );
        check(
            self.session.id_length >= 16,
            "Session id length should be at least 128 bits (16 bytes)",
        );
        check(
            self.session.max_sessions_per_user > 0,
            "At least one session per user must be allowed",
        );

        check(matches!(self.totp.digits, 6 | 8), "TOTP digits must be 6 or 8");
        check(self.totp.step > 0, "TOTP step must be non-zero");

        check(self.password.time_cost > 0, "Argon2 time cost must be non-zero");
        check(self.password.parallelism > 0, "Argon2 parallelism must be non-zero");

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Settings that work but fall below recommended strength
    pub fn advisories(&self) -> Vec<String> {
        let mut advisories = Vec::new();
        if self.password.memory_cost < ARGON2_MIN_MEMORY_KIB {
            advisories.push(format!(
                "Argon2 memory cost is below the OWASP minimum of {ARGON2_MIN_MEMORY_KIB} KiB"
            ));
        }
        if self.password.time_cost < ARGON2_MIN_ITERATIONS {
            advisories.push(format!(
                "Argon2 time cost is below the OWASP minimum of {ARGON2_MIN_ITERATIONS}"
            ));
        }
        advisories
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_duration(name: &str) -> AuthResult<Option<Duration>> {
    env_string(name).map(|raw| parse_duration(name, &raw)).transpose()
}

fn parse_duration(name: &str, raw: &str) -> AuthResult<Duration> {
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| AuthError::Config(format!("{name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> AuthConfig {
        let mut config = AuthConfig::default();
        config.token.secret = "k".repeat(32);
        config
    }

    #[test]
    fn test_defaults() {
        let config = AuthConfig::default();
        assert_eq!(config.token.access_token_lifetime, Duration::from_secs(3600));
        assert_eq!(config.token.refresh_token_lifetime, config.session.lifetime);
        assert_eq!(config.session.idle_timeout, Duration::from_secs(30 * 60));
        assert_eq!(config.totp.algorithm, TotpAlgorithm::Sha1);
        assert_eq!(config.password.memory_cost, ARGON2_MIN_MEMORY_KIB);
    }

    #[test]
    fn test_unset_secret_is_reported() {
        let problems = AuthConfig::default().validate().unwrap_err();
        assert_eq!(problems, vec!["Token secret must be set".to_string()]);
    }

    #[test]
    fn test_configured_defaults_validate() {
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut config = configured();
        config.session.idle_timeout = config.session.lifetime + Duration::from_secs(1);
        config.totp.digits = 7;
        config.totp.step = 0;

        let problems = config.validate().unwrap_err();
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("Idle timeout")));
        assert!(problems.iter().any(|p| p.contains("TOTP step")));
    }

    #[test]
    fn test_weak_argon2_costs_are_advisories_not_errors() {
        let mut config = configured();
        config.password.memory_cost = 4096;
        config.password.time_cost = 1;

        assert!(config.validate().is_ok());
        assert_eq!(config.advisories().len(), 2);
        assert!(configured().advisories().is_empty());

        config.password.time_cost = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let json = r#"{"lifetime":"8h","idle_timeout":"15m","max_sessions_per_user":3}"#;
        let session: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(session.lifetime, Duration::from_secs(8 * 3600));
        assert_eq!(session.idle_timeout, Duration::from_secs(15 * 60));
        assert_eq!(session.max_sessions_per_user, 3);
        assert_eq!(session.refresh_threshold, Duration::from_secs(5 * 60));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("X", "90s").unwrap(), Duration::from_secs(90));
        let err = parse_duration("FLEETGATE_SESSION_LIFETIME", "soon").unwrap_err();
        assert!(matches!(
            err,
            AuthError::Config(msg) if msg.starts_with("FLEETGATE_SESSION_LIFETIME")
        ));
    }
}
