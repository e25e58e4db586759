//! Token Service
//!
//! Signed, expiring tokens for the dashboard:
//! - Access tokens (short-lived) embedded in every session
//! - Refresh tokens (session-lifetime) carrying `type: "refresh"`
//! - HS256 signatures over `header.payload`
//!
//! Verification checks structure, signature, expiry, issuer and audience.
//! Each failure has its own reason for logs, but clients see one uniform
//! "invalid token" outcome (see [`AuthError::client_message`]).

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::error::{AuthError, AuthResult};
use crate::types::{ClaimSet, TokenClaims, TokenKind, TokenPair};

/// Token service for creating and verifying signed tokens
///
/// Stateless apart from the signing key, which is read-only after
/// construction; clones share nothing mutable.
#[derive(Clone)]
pub struct TokenService {
    config: TokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    /// Create a new token service
    pub fn new(config: TokenConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// Get the config reference
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Lifetime for a token kind
    pub fn ttl(&self, kind: TokenKind) -> std::time::Duration {
        match kind {
            TokenKind::Access => self.config.access_token_lifetime,
            TokenKind::Refresh => self.config.refresh_token_lifetime,
        }
    }

    /// Create a signed token issued now
    pub fn create_token(&self, claims: ClaimSet, kind: TokenKind) -> AuthResult<String> {
        self.issue_at(claims, kind, Utc::now())
    }

    /// Create a signed token with an explicit issue time
    pub fn issue_at(
        &self,
        claims: ClaimSet,
        kind: TokenKind,
        issued_at: DateTime<Utc>,
    ) -> AuthResult<String> {
        self.issue(claims, kind, issued_at).map(|(token, _)| token)
    }

    /// Generate a new token pair (access + refresh) for the same claims
    pub fn create_token_pair(&self, claims: ClaimSet) -> AuthResult<TokenPair> {
        let now = Utc::now();
        let (access_token, access_exp) = self.issue(claims.clone(), TokenKind::Access, now)?;
        let (refresh_token, refresh_exp) = self.issue(claims, TokenKind::Refresh, now)?;

        Ok(TokenPair::new(access_token, refresh_token, access_exp, refresh_exp))
    }

    /// Verify a token of either kind and return its claims
    pub fn verify_token(&self, token: &str) -> AuthResult<TokenClaims> {
        if token.split('.').count() != 3 {
            return Err(AuthError::InvalidTokenStructure);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_exp = true;
        validation.leeway = 0;

        let token_data = decode::<TokenClaims>(token, &self.decoding_key, &validation)?;

        Ok(token_data.claims)
    }

    /// Verify a token and require it to be an access token for a completed login
    ///
    /// Tokens minted while the second factor is pending fail with
    /// `TwoFactorRequired`; they only identify the pending session.
    pub fn verify_access_token(&self, token: &str) -> AuthResult<TokenClaims> {
        let claims = self.verify_token(token)?;
        if claims.token_type != TokenKind::Access {
            return Err(AuthError::InvalidTokenType);
        }
        if !claims.two_factor_verified {
            return Err(AuthError::TwoFactorRequired);
        }
        Ok(claims)
    }

    /// Verify a token and require it to be a refresh token
    pub fn verify_refresh_token(&self, token: &str) -> AuthResult<TokenClaims> {
        let claims = self.verify_token(token)?;
        if claims.token_type != TokenKind::Refresh {
            return Err(AuthError::InvalidTokenType);
        }
        Ok(claims)
    }

    /// Re-issue a valid token with fresh `iat`/`exp`, keeping its other claims
    pub fn refresh_token(&self, token: &str) -> AuthResult<String> {
        let claims = self.verify_token(token)?;
        let kind = claims.token_type;
        let claim_set = claims.claim_set().ok_or(AuthError::InvalidTokenFormat)?;

        self.create_token(claim_set, kind)
    }

    /// Decode a token without verifying anything
    ///
    /// Only for non-trust-sensitive inspection such as displaying expiry.
    pub fn decode_token(&self, token: &str) -> Option<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims::<&str>(&[]);

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .ok()
            .map(|data| data.claims)
    }

    /// Get remaining time until token expiry (unverified)
    pub fn token_ttl(&self, token: &str) -> Option<std::time::Duration> {
        let claims = self.decode_token(token)?;
        let exp = DateTime::from_timestamp(claims.exp, 0)?;
        let now = Utc::now();
        if exp > now {
            (exp - now).to_std().ok()
        } else {
            None
        }
    }

    fn issue(
        &self,
        claims: ClaimSet,
        kind: TokenKind,
        issued_at: DateTime<Utc>,
    ) -> AuthResult<(String, i64)> {
        let ttl = Duration::from_std(self.ttl(kind))
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        let exp = (issued_at + ttl).timestamp();

        let token_claims = TokenClaims {
            sub: claims.user_id.to_string(),
            role: claims.role,
            permissions: claims.permissions,
            sid: claims.session_id,
            token_type: kind,
            iat: issued_at.timestamp(),
            exp,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            jti: Uuid::new_v4().to_string(),
            two_factor_verified: claims.two_factor_verified,
        };

        let token = encode(&Header::new(Algorithm::HS256), &token_claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("Failed to encode token: {}", e)))?;

        Ok((token, exp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_config() -> TokenConfig {
        TokenConfig {
            secret: "test-secret-key-for-fleetgate-tokens-32b!".to_string(),
            access_token_lifetime: std::time::Duration::from_secs(3600),
            refresh_token_lifetime: std::time::Duration::from_secs(86400),
            issuer: "test-issuer".to_string(),
            audience: "test-audience".to_string(),
        }
    }

    fn claims() -> ClaimSet {
        ClaimSet {
            user_id: Uuid::new_v4(),
            role: "operator".to_string(),
            permissions: vec!["read:shipments".to_string(), "write:shipments".to_string()],
            session_id: Some("session-abc".to_string()),
            two_factor_verified: true,
        }
    }

    #[test]
    fn test_round_trip_preserves_claims() {
        let service = TokenService::new(test_config());
        let input = claims();

        let token = service.create_token(input.clone(), TokenKind::Access).unwrap();
        let verified = service.verify_token(&token).unwrap();

        assert_eq!(verified.claim_set(), Some(input));
        assert_eq!(verified.iss, "test-issuer");
        assert_eq!(verified.aud, "test-audience");
        assert_eq!(verified.exp - verified.iat, 3600);
        assert_eq!(verified.token_type, TokenKind::Access);
    }

    #[test]
    fn test_expiry_boundary() {
        let service = TokenService::new(test_config());
        let ttl = Duration::seconds(3600);
        let now = Utc::now();

        // exp = now - 1
        let expired = service
            .issue_at(claims(), TokenKind::Access, now - ttl - Duration::seconds(1))
            .unwrap();
        assert!(matches!(service.verify_token(&expired), Err(AuthError::TokenExpired)));

        // exp = now + 1
        let fresh = service
            .issue_at(claims(), TokenKind::Access, now - ttl + Duration::seconds(1))
            .unwrap();
        assert!(service.verify_token(&fresh).is_ok());
    }

    #[test]
    fn test_invalid_structure() {
        let service = TokenService::new(test_config());
        assert!(matches!(
            service.verify_token("only.two"),
            Err(AuthError::InvalidTokenStructure)
        ));
        assert!(matches!(
            service.verify_token("a.b.c.d"),
            Err(AuthError::InvalidTokenStructure)
        ));
    }

    #[test]
    fn test_tampered_payload_fails_signature() {
        let service = TokenService::new(test_config());
        let token = service.create_token(claims(), TokenKind::Access).unwrap();

        // Swap in the payload of a different token, keeping the original signature
        let other = service.create_token(claims(), TokenKind::Access).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let other_parts: Vec<&str> = other.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], other_parts[1], parts[2]);

        assert!(matches!(service.verify_token(&forged), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_wrong_secret_fails_signature() {
        let service = TokenService::new(test_config());
        let mut other_config = test_config();
        other_config.secret = "another-secret-key-entirely-32-bytes!!".to_string();
        let other = TokenService::new(other_config);

        let token = other.create_token(claims(), TokenKind::Access).unwrap();
        assert!(matches!(service.verify_token(&token), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn test_issuer_and_audience_mismatch() {
        let service = TokenService::new(test_config());

        let mut foreign_issuer = test_config();
        foreign_issuer.issuer = "someone-else".to_string();
        let token = TokenService::new(foreign_issuer)
            .create_token(claims(), TokenKind::Access)
            .unwrap();
        assert!(matches!(
            service.verify_token(&token),
            Err(AuthError::InvalidIssuerOrAudience)
        ));

        let mut foreign_audience = test_config();
        foreign_audience.audience = "mobile-app".to_string();
        let token = TokenService::new(foreign_audience)
            .create_token(claims(), TokenKind::Access)
            .unwrap();
        assert!(matches!(
            service.verify_token(&token),
            Err(AuthError::InvalidIssuerOrAudience)
        ));
    }

    #[test]
    fn test_token_pair_kinds() {
        let service = TokenService::new(test_config());
        let pair = service.create_token_pair(claims()).unwrap();

        assert!(service.verify_access_token(&pair.access_token).is_ok());
        assert!(service.verify_refresh_token(&pair.refresh_token).is_ok());
        assert!(matches!(
            service.verify_refresh_token(&pair.access_token),
            Err(AuthError::InvalidTokenType)
        ));
        assert_eq!(pair.refresh_expires_at - pair.access_expires_at, 86400 - 3600);
        assert_eq!(pair.token_type, "Bearer");
    }

    #[test]
    fn test_pending_two_factor_access_token_rejected() {
        let service = TokenService::new(test_config());
        let pending = ClaimSet {
            two_factor_verified: false,
            ..claims()
        };
        let pair = service.create_token_pair(pending).unwrap();

        // Still a well-formed, signed token for the pending session
        let claims = service.verify_token(&pair.access_token).unwrap();
        assert!(!claims.two_factor_verified);
        assert_eq!(claims.sid.as_deref(), Some("session-abc"));

        assert!(matches!(
            service.verify_access_token(&pair.access_token),
            Err(AuthError::TwoFactorRequired)
        ));
    }

    #[test]
    fn test_refresh_token_reissues_same_claims() {
        let service = TokenService::new(test_config());
        let input = claims();
        let now = Utc::now();
        let old = service
            .issue_at(input.clone(), TokenKind::Refresh, now - Duration::seconds(600))
            .unwrap();

        let renewed = service.refresh_token(&old).unwrap();
        let old_claims = service.verify_token(&old).unwrap();
        let new_claims = service.verify_token(&renewed).unwrap();

        assert_eq!(new_claims.claim_set(), Some(input));
        assert_eq!(new_claims.token_type, TokenKind::Refresh);
        assert!(new_claims.exp > old_claims.exp);
        assert_ne!(new_claims.jti, old_claims.jti);
    }

    #[test]
    fn test_refresh_rejects_invalid_input() {
        let service = TokenService::new(test_config());
        assert!(service.refresh_token("garbage").is_err());

        let expired = service
            .issue_at(claims(), TokenKind::Access, Utc::now() - Duration::days(1))
            .unwrap();
        assert!(matches!(service.refresh_token(&expired), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_decode_without_verification() {
        let service = TokenService::new(test_config());
        let expired = service
            .issue_at(claims(), TokenKind::Access, Utc::now() - Duration::days(1))
            .unwrap();

        let decoded = service.decode_token(&expired).unwrap();
        assert_eq!(decoded.role, "operator");
        assert!(service.token_ttl(&expired).is_none());
        assert!(service.decode_token("not-a-token").is_none());
    }

    #[test]
    fn test_token_ttl() {
        let service = TokenService::new(test_config());
        let token = service.create_token(claims(), TokenKind::Access).unwrap();
        let ttl = service.token_ttl(&token).unwrap();
        assert!(ttl.as_secs() > 3590 && ttl.as_secs() <= 3600);
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            role in "[a-z]{1,12}",
            permissions in proptest::collection::vec("[a-z]{1,8}:[a-z]{1,8}", 0..6),
            session in proptest::option::of("[A-Za-z0-9_-]{8,43}"),
            two_factor_verified in any::<bool>(),
        ) {
            let service = TokenService::new(test_config());
            let input = ClaimSet {
                user_id: Uuid::new_v4(),
                role,
                permissions,
                session_id: session,
                two_factor_verified,
            };
            let token = service.create_token(input.clone(), TokenKind::Access).unwrap();
            let verified = service.verify_token(&token).unwrap();
            prop_assert_eq!(verified.claim_set(), Some(input));
        }
    }
}
