//! Authentication service
//!
//! Orchestrates the components: credential checks against the external
//! [`UserService`], second-factor verification, session creation,
//! password reset and session-scoped authorization.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditSink, MemoryAuditSink, TracingAuditSink};
use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::guard::{
    AccessContext, AccessDecision, AccessSubject, ResourceRef, SecurityGuard, LOGIN_ROUTE,
};
use crate::password::PasswordService;
use crate::rbac::RolePermissionService;
use crate::session::SessionManager;
use crate::store::{MemorySnapshotStore, SessionSnapshotStore};
use crate::token::TokenService;
use crate::totp::{MemoryTwoFactorStore, TwoFactorService, TwoFactorStore};
use crate::types::{
    DeviceInfo, LoginOutcome, LoginRequest, LogoutResponse, NewUser, PasswordResetTicket,
    RegisterRequest, Session, SessionUser, TokenPair, TotpEnrollment, UserInfo, UserPatch,
};
use crate::user::{MemoryUserService, UserService};

/// Role given to self-registered users
pub const DEFAULT_ROLE: &str = "viewer";

#[derive(Debug, Clone)]
struct ResetEntry {
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// Main authentication service combining every component
#[derive(Clone)]
pub struct AuthService {
    pub tokens: TokenService,
    pub rbac: RolePermissionService,
    pub two_factor: TwoFactorService,
    pub sessions: Arc<SessionManager>,
    pub guard: Arc<SecurityGuard>,
    pub password: PasswordService,
    users: Arc<dyn UserService>,
    audit: Arc<dyn AuditSink>,
    /// SHA-256 of reset token -> owner and expiry
    reset_tokens: Arc<DashMap<String, ResetEntry>>,
    config: AuthConfig,
}

impl AuthService {
    /// Wire the components around injected collaborators
    ///
    /// Fails with `Config` listing every problem
    /// [`AuthConfig::validate`] finds.
    pub fn new(
        config: AuthConfig,
        users: Arc<dyn UserService>,
        two_factor_store: Arc<dyn TwoFactorStore>,
        snapshots: Arc<dyn SessionSnapshotStore>,
        audit: Arc<dyn AuditSink>,
    ) -> AuthResult<Self> {
        config.validate().map_err(|problems| AuthError::Config(problems.join("; ")))?;
        for advisory in config.advisories() {
            tracing::warn!(advisory = %advisory, "Weak auth configuration");
        }

        let tokens = TokenService::new(config.token.clone());
        let rbac = RolePermissionService::new();
        let two_factor = TwoFactorService::new(config.totp.clone(), two_factor_store);
        let sessions = Arc::new(SessionManager::new(
            config.session.clone(),
            tokens.clone(),
            snapshots,
            audit.clone(),
        ));
        let guard = Arc::new(SecurityGuard::new(rbac.clone()));
        let password = PasswordService::new(config.password.clone());

        Ok(Self {
            tokens,
            rbac,
            two_factor,
            sessions,
            guard,
            password,
            users,
            audit,
            reset_tokens: Arc::new(DashMap::new()),
            config,
        })
    }

    /// Service backed entirely by in-memory collaborators, auditing to `tracing`
    pub fn in_memory(config: AuthConfig) -> AuthResult<Self> {
        Self::new(
            config,
            Arc::new(MemoryUserService::new()),
            Arc::new(MemoryTwoFactorStore::new()),
            Arc::new(MemorySnapshotStore::new()),
            Arc::new(TracingAuditSink),
        )
    }

    /// In-memory service that also returns its audit sink for inspection
    pub fn in_memory_with_audit(config: AuthConfig) -> AuthResult<(Self, Arc<MemoryAuditSink>)> {
        let audit = Arc::new(MemoryAuditSink::new());
        let service = Self::new(
            config,
            Arc::new(MemoryUserService::new()),
            Arc::new(MemoryTwoFactorStore::new()),
            Arc::new(MemorySnapshotStore::new()),
            audit.clone(),
        )?;
        Ok((service, audit))
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn users(&self) -> &Arc<dyn UserService> {
        &self.users
    }

    // =========================================================================
    // Registration & Login
    // =========================================================================

    /// Create an account with the default role
    pub async fn register(&self, request: RegisterRequest) -> AuthResult<UserInfo> {
        if self.users.get_user_by_email(&request.email).await?.is_some() {
            return Err(AuthError::EmailAlreadyExists);
        }

        let password_hash = self.password.hash_password(&request.password)?;
        let user = self
            .users
            .create_user(NewUser {
                email: request.email,
                name: request.name,
                password_hash,
                role: DEFAULT_ROLE.to_string(),
            })
            .await?;

        tracing::info!(user_id = %user.id, role = %user.role, "User registered");
        self.audit.log(
            AuditCategory::Registration,
            "User registered",
            json!({ "user_id": user.id, "email": user.email }),
        );

        Ok(UserInfo::from(&user))
    }

    /// Authenticate credentials and open a session
    ///
    /// When the account has 2FA enabled and no code was supplied, the session
    /// is created pending and `two_factor_required` is set.
    pub async fn login(
        &self,
        request: LoginRequest,
        device_info: DeviceInfo,
    ) -> AuthResult<LoginOutcome> {
        let Some(user) = self.users.get_user_by_email(&request.email).await? else {
            return Err(self.login_failed(&request.email, None, "unknown_email"));
        };

        let verified = self.password.verify_password(&request.password, &user.password_hash);
        let password_ok = match verified {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(user_id = %user.id, error = %e, "Stored password hash unusable");
                false
            }
        };
        if !password_ok {
            return Err(self.login_failed(&request.email, Some(user.id), "bad_password"));
        }

        if !user.active {
            tracing::warn!(user_id = %user.id, "Login attempt on disabled account");
            self.audit.log(
                AuditCategory::LoginFailed,
                "Login rejected: account disabled",
                json!({ "user_id": user.id, "reason": "account_disabled" }),
            );
            return Err(AuthError::AccountDisabled);
        }

        let permissions: Vec<String> =
            self.rbac.get_role_permissions(&user.role).into_iter().collect();

        let two_factor_verified = if user.two_factor_enabled {
            match request.two_factor_code.as_deref() {
                Some(code) => {
                    self.verify_second_factor(user.id, code).await?;
                    true
                }
                None => false,
            }
        } else {
            true
        };

        let session = self
            .sessions
            .create_session(
                &SessionUser {
                    user_id: user.id,
                    role: user.role.clone(),
                    permissions,
                    two_factor_verified,
                },
                device_info,
            )
            .await?;

        let user = self
            .users
            .update_user(
                user.id,
                UserPatch {
                    last_login_at: Some(session.created_at),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            user_id = %user.id,
            session_id = %session.id,
            two_factor_pending = !two_factor_verified,
            "User logged in"
        );
        self.audit.log(
            AuditCategory::Login,
            "User logged in",
            json!({
                "user_id": user.id,
                "session_id": session.id,
                "two_factor_pending": !two_factor_verified,
            }),
        );

        let tokens = self.token_pair(&session);
        Ok(LoginOutcome {
            user: UserInfo::from(&user),
            session,
            tokens,
            two_factor_required: !two_factor_verified,
        })
    }

    /// Finish a login that is waiting on its second factor
    pub async fn complete_two_factor(&self, session_id: &str, code: &str) -> AuthResult<Session> {
        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or(AuthError::SessionNotFound)?;
        if session.two_factor_verified {
            return Ok(session);
        }

        self.verify_second_factor(session.user_id, code).await?;
        let session = self.sessions.mark_two_factor_verified(session_id).await?;

        self.audit.log(
            AuditCategory::Login,
            "Two-factor login completed",
            json!({ "user_id": session.user_id, "session_id": session.id }),
        );
        Ok(session)
    }

    /// End a session; logging out twice is not an error
    pub async fn logout(
        &self,
        session_id: &str,
        reason: Option<&str>,
    ) -> AuthResult<LogoutResponse> {
        let reason = reason.unwrap_or("logout");
        let user_id = self.sessions.get_session(session_id).await?.map(|s| s.user_id);

        if self.sessions.destroy_session(session_id, reason).await? {
            tracing::info!(session_id = %session_id, user_id = ?user_id, "User logged out");
            self.audit.log(
                AuditCategory::Logout,
                "User logged out",
                json!({ "session_id": session_id, "user_id": user_id, "reason": reason }),
            );
        }

        Ok(LogoutResponse { success: true })
    }

    /// Record activity on a session; see [`SessionManager::update_session`]
    pub async fn refresh(&self, session_id: &str) -> AuthResult<Session> {
        self.sessions.update_session(session_id).await
    }

    // =========================================================================
    // Passwords
    // =========================================================================

    /// Issue a single-use reset token; `None` for unknown or disabled accounts
    pub async fn request_password_reset(
        &self,
        email: &str,
    ) -> AuthResult<Option<PasswordResetTicket>> {
        let now = Utc::now();
        self.reset_tokens.retain(|_, entry| entry.expires_at > now);

        let user = match self.users.get_user_by_email(email).await? {
            Some(user) if user.active => user,
            _ => {
                tracing::debug!("Password reset requested for unknown or disabled account");
                return Ok(None);
            }
        };

        // One outstanding token per user
        self.reset_tokens.retain(|_, entry| entry.user_id != user.id);

        let mut bytes = vec![0u8; self.config.reset.token_length];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(&bytes);
        let ttl = Duration::from_std(self.config.reset.token_ttl)
            .map_err(|e| AuthError::Config(e.to_string()))?;
        let expires_at = now + ttl;

        self.reset_tokens.insert(
            hash_reset_token(&token),
            ResetEntry {
                user_id: user.id,
                expires_at,
            },
        );

        tracing::info!(user_id = %user.id, "Password reset requested");
        Ok(Some(PasswordResetTicket {
            user_id: user.id,
            token,
            expires_at,
        }))
    }

    /// Set a new password with a reset token and end every session of the user
    pub async fn confirm_password_reset(&self, token: &str, new_password: &str) -> AuthResult<()> {
        // Weak passwords are rejected before the token is spent
        self.password.validate_password_strength(new_password)?;

        let (_, entry) = self
            .reset_tokens
            .remove(&hash_reset_token(token))
            .ok_or(AuthError::InvalidResetToken)?;
        if entry.expires_at <= Utc::now() {
            return Err(AuthError::InvalidResetToken);
        }

        let password_hash = self.password.hash_password(new_password)?;
        self.users
            .update_user(
                entry.user_id,
                UserPatch {
                    password_hash: Some(password_hash),
                    ..Default::default()
                },
            )
            .await?;

        let destroyed = self.sessions.destroy_user_sessions(entry.user_id, None).await?;

        tracing::info!(
            user_id = %entry.user_id,
            sessions_destroyed = destroyed,
            "Password reset completed"
        );
        self.audit.log(
            AuditCategory::PasswordReset,
            "Password reset",
            json!({ "user_id": entry.user_id, "sessions_destroyed": destroyed }),
        );
        Ok(())
    }

    /// Change a password after checking the current one
    pub async fn change_password(
        &self,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        let user = self.users.get_user_by_id(user_id).await?.ok_or(AuthError::UserNotFound)?;

        if !self.password.verify_password(old_password, &user.password_hash)? {
            tracing::warn!(user_id = %user_id, "Password change rejected: wrong current password");
            return Err(AuthError::InvalidCredentials);
        }

        let password_hash = self.password.hash_password(new_password)?;
        self.users
            .update_user(
                user_id,
                UserPatch {
                    password_hash: Some(password_hash),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(user_id = %user_id, "Password changed");
        self.audit.log(
            AuditCategory::PasswordChanged,
            "Password changed",
            json!({ "user_id": user_id }),
        );
        Ok(())
    }

    // =========================================================================
    // Session-scoped Authorization
    // =========================================================================

    /// Resolve a session into an access subject, recording activity
    pub async fn subject(&self, session_id: &str) -> AuthResult<AccessSubject> {
        let session = self.sessions.update_session(session_id).await?;
        Ok(AccessSubject::from(&session))
    }

    pub async fn has_permission(&self, session_id: &str, permission: &str) -> AuthResult<bool> {
        let subject = self.verified_subject(session_id).await?;
        Ok(self.rbac.grants(&subject.role, &subject.permissions, permission))
    }

    pub async fn has_role(&self, session_id: &str, role: &str) -> AuthResult<bool> {
        let subject = self.verified_subject(session_id).await?;
        Ok(self.rbac.has_role(&subject.role, role))
    }

    pub async fn has_any_role(&self, session_id: &str, roles: &[&str]) -> AuthResult<bool> {
        let subject = self.verified_subject(session_id).await?;
        Ok(self.rbac.has_any_role(&subject.role, roles))
    }

    /// Subject for authorization answers; a pending second factor grants nothing
    async fn verified_subject(&self, session_id: &str) -> AuthResult<AccessSubject> {
        let subject = self.subject(session_id).await?;
        if !subject.two_factor_verified {
            return Err(AuthError::TwoFactorRequired);
        }
        Ok(subject)
    }

    pub async fn can_access_route(
        &self,
        session_id: Option<&str>,
        route: &str,
        ctx: &AccessContext,
    ) -> AccessDecision {
        match self.resolve_subject(session_id).await {
            Ok(subject) => self.guard.can_access_route(subject.as_ref(), route, ctx),
            Err(denied) => denied,
        }
    }

    pub async fn can_access_component(
        &self,
        session_id: Option<&str>,
        component: &str,
        ctx: &AccessContext,
    ) -> AccessDecision {
        match self.resolve_subject(session_id).await {
            Ok(subject) => self.guard.can_access_component(subject.as_ref(), component, ctx),
            Err(denied) => denied,
        }
    }

    pub async fn can_perform_action(
        &self,
        session_id: Option<&str>,
        action: &str,
        resource: Option<&ResourceRef>,
    ) -> AccessDecision {
        match self.resolve_subject(session_id).await {
            Ok(subject) => self.guard.can_perform_action(subject.as_ref(), action, resource),
            Err(denied) => denied,
        }
    }

    // =========================================================================
    // Two-Factor
    // =========================================================================

    /// Start 2FA enrollment for a user
    pub async fn setup_2fa(&self, user_id: Uuid) -> AuthResult<TotpEnrollment> {
        let user = self.users.get_user_by_id(user_id).await?.ok_or(AuthError::UserNotFound)?;
        self.two_factor.generate_secret_key(user.id, &user.email).await
    }

    /// Confirm enrollment; returns the plaintext backup codes
    pub async fn enable_2fa(&self, user_id: Uuid, code: &str) -> AuthResult<Vec<String>> {
        let codes = match self.two_factor.enable_2fa(user_id, code).await {
            Ok(codes) => codes,
            Err(e) => {
                self.audit_two_factor_failure(user_id, &e);
                return Err(e);
            }
        };

        self.users
            .update_user(
                user_id,
                UserPatch {
                    two_factor_enabled: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        self.audit.log(
            AuditCategory::TwoFactorEnabled,
            "Two-factor authentication enabled",
            json!({ "user_id": user_id }),
        );
        Ok(codes)
    }

    pub async fn disable_2fa(&self, user_id: Uuid, code: &str) -> AuthResult<()> {
        if let Err(e) = self.two_factor.disable_2fa(user_id, code).await {
            self.audit_two_factor_failure(user_id, &e);
            return Err(e);
        }

        self.users
            .update_user(
                user_id,
                UserPatch {
                    two_factor_enabled: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        self.audit.log(
            AuditCategory::TwoFactorDisabled,
            "Two-factor authentication disabled",
            json!({ "user_id": user_id }),
        );
        Ok(())
    }

    pub async fn verify_totp_code(&self, user_id: Uuid, code: &str) -> AuthResult<()> {
        let result = self.two_factor.verify_totp_code(user_id, code).await;
        if let Err(ref e) = result {
            self.audit_two_factor_failure(user_id, e);
        }
        result
    }

    /// Consume a backup code; returns how many remain
    pub async fn verify_backup_code(&self, user_id: Uuid, code: &str) -> AuthResult<usize> {
        match self.two_factor.verify_backup_code(user_id, code).await {
            Ok(remaining) => {
                self.audit.log(
                    AuditCategory::BackupCodeUsed,
                    "Backup code used",
                    json!({ "user_id": user_id, "remaining": remaining }),
                );
                Ok(remaining)
            }
            Err(e) => {
                self.audit_two_factor_failure(user_id, &e);
                Err(e)
            }
        }
    }

    pub async fn regenerate_backup_codes(&self, user_id: Uuid) -> AuthResult<Vec<String>> {
        self.two_factor.regenerate_backup_codes(user_id).await
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// TOTP first, then a backup code
    async fn verify_second_factor(&self, user_id: Uuid, code: &str) -> AuthResult<()> {
        match self.two_factor.verify_totp_code(user_id, code).await {
            Ok(()) => return Ok(()),
            Err(AuthError::InvalidTwoFactorCode) => {}
            Err(e) => return Err(e),
        }

        match self.verify_backup_code(user_id, code).await {
            Ok(_) => Ok(()),
            Err(AuthError::InvalidBackupCode | AuthError::TwoFactorNotEnabled) => {
                Err(AuthError::InvalidTwoFactorCode)
            }
            Err(e) => Err(e),
        }
    }

    fn audit_two_factor_failure(&self, user_id: Uuid, error: &AuthError) {
        if matches!(
            error,
            AuthError::InvalidTwoFactorCode | AuthError::InvalidBackupCode
        ) {
            self.audit.log(
                AuditCategory::TwoFactorFailed,
                "Two-factor verification failed",
                json!({ "user_id": user_id, "reason": error.reason() }),
            );
        }
    }

    fn login_failed(&self, email: &str, user_id: Option<Uuid>, reason: &str) -> AuthError {
        tracing::warn!(email = %email, reason = reason, "Login failed");
        self.audit.log(
            AuditCategory::LoginFailed,
            "Login failed",
            json!({ "email": email, "user_id": user_id, "reason": reason }),
        );
        AuthError::InvalidCredentials
    }

    /// Session lookup for guard checks; failures become denials
    async fn resolve_subject(
        &self,
        session_id: Option<&str>,
    ) -> Result<Option<AccessSubject>, AccessDecision> {
        let Some(id) = session_id else {
            return Ok(None);
        };

        match self.subject(id).await {
            Ok(subject) => Ok(Some(subject)),
            Err(AuthError::SessionExpired) => {
                Err(AccessDecision::deny("Session expired", Some(LOGIN_ROUTE)))
            }
            Err(AuthError::SessionNotFound) => {
                Err(AccessDecision::deny("Session not found", Some(LOGIN_ROUTE)))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session lookup failed during access check");
                Err(AccessDecision::deny(e.client_message(), None))
            }
        }
    }

    fn token_pair(&self, session: &Session) -> TokenPair {
        let exp = |token: &str| self.tokens.decode_token(token).map(|c| c.exp).unwrap_or_default();
        TokenPair::new(
            session.access_token.clone(),
            session.refresh_token.clone(),
            exp(&session.access_token),
            exp(&session.refresh_token),
        )
    }
}

fn hash_reset_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PasswordConfig;

    const PASSWORD: &str = "Forklift42Yard";

    fn config() -> AuthConfig {
        let mut config = AuthConfig::default();
        config.token.secret = "service-test-secret-at-least-32-bytes".to_string();
        config.password = PasswordConfig {
            memory_cost: 4096,
            time_cost: 1,
            ..PasswordConfig::default()
        };
        config
    }

    async fn registered() -> (AuthService, Arc<MemoryAuditSink>, UserInfo) {
        let (auth, audit) = AuthService::in_memory_with_audit(config()).unwrap();
        let user = auth
            .register(RegisterRequest {
                email: "yard@depot.example".to_string(),
                password: PASSWORD.to_string(),
                name: None,
            })
            .await
            .unwrap();
        (auth, audit, user)
    }

    fn login_request(password: &str) -> LoginRequest {
        LoginRequest {
            email: "yard@depot.example".to_string(),
            password: password.to_string(),
            two_factor_code: None,
        }
    }

    #[test]
    fn test_requires_secret() {
        assert!(matches!(
            AuthService::in_memory(AuthConfig::default()),
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unusable_config() {
        let mut zero_step = config();
        zero_step.totp.step = 0;
        let mut ten_digits = config();
        ten_digits.totp.digits = 10;
        let mut late_refresh = config();
        late_refresh.session.refresh_threshold = late_refresh.token.access_token_lifetime;
        let mut short_secret = config();
        short_secret.token.secret = "too-short".to_string();

        for bad in [zero_step, ten_digits, late_refresh, short_secret] {
            assert!(matches!(AuthService::in_memory(bad), Err(AuthError::Config(_))));
        }

        match AuthService::in_memory({
            let mut both = config();
            both.totp.step = 0;
            both.totp.digits = 7;
            both
        }) {
            Err(AuthError::Config(msg)) => {
                assert!(msg.contains("TOTP step"));
                assert!(msg.contains("TOTP digits"));
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_register_defaults_and_duplicates() {
        let (auth, audit, user) = registered().await;
        assert_eq!(user.role, DEFAULT_ROLE);
        assert_eq!(audit.count(AuditCategory::Registration), 1);

        let err = auth
            .register(RegisterRequest {
                email: "YARD@depot.example".to_string(),
                password: PASSWORD.to_string(),
                name: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailAlreadyExists));

        let err = auth
            .register(RegisterRequest {
                email: "new@depot.example".to_string(),
                password: "weak".to_string(),
                name: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::WeakPassword(_)));
    }

    #[tokio::test]
    async fn test_login_success() {
        let (auth, audit, user) = registered().await;
        let outcome = auth.login(login_request(PASSWORD), DeviceInfo::default()).await.unwrap();

        assert_eq!(outcome.user.id, user.id);
        assert!(!outcome.two_factor_required);
        assert!(outcome.session.two_factor_verified);
        assert_eq!(outcome.tokens.access_token, outcome.session.access_token);
        assert!(outcome.tokens.refresh_expires_at > outcome.tokens.access_expires_at);
        assert_eq!(audit.count(AuditCategory::Login), 1);

        let stored = auth.users().get_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.last_login_at, Some(outcome.session.created_at));
    }

    #[tokio::test]
    async fn test_bad_credentials_are_indistinguishable() {
        let (auth, audit, _) = registered().await;

        let wrong_password = auth
            .login(login_request("Forklift42Yarx"), DeviceInfo::default())
            .await
            .unwrap_err();
        let mut unknown = login_request(PASSWORD);
        unknown.email = "ghost@depot.example".to_string();
        let wrong_email = auth.login(unknown, DeviceInfo::default()).await.unwrap_err();

        assert_eq!(wrong_password.to_string(), wrong_email.to_string());
        assert!(matches!(wrong_email, AuthError::InvalidCredentials));
        assert_eq!(audit.count(AuditCategory::LoginFailed), 2);
    }

    #[tokio::test]
    async fn test_disabled_account() {
        let (auth, _, user) = registered().await;
        auth.users()
            .update_user(user.id, UserPatch { active: Some(false), ..Default::default() })
            .await
            .unwrap();

        let err = auth.login(login_request(PASSWORD), DeviceInfo::default()).await.unwrap_err();
        assert!(matches!(err, AuthError::AccountDisabled));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (auth, audit, _) = registered().await;
        let outcome = auth.login(login_request(PASSWORD), DeviceInfo::default()).await.unwrap();

        assert!(auth.logout(&outcome.session.id, None).await.unwrap().success);
        assert!(auth.logout(&outcome.session.id, None).await.unwrap().success);
        assert_eq!(audit.count(AuditCategory::Logout), 1);
        assert!(matches!(auth.refresh(&outcome.session.id).await, Err(AuthError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_password_reset_flow() {
        let (auth, audit, user) = registered().await;
        let outcome = auth.login(login_request(PASSWORD), DeviceInfo::default()).await.unwrap();

        assert!(auth.request_password_reset("ghost@depot.example").await.unwrap().is_none());

        let ticket = auth.request_password_reset("yard@depot.example").await.unwrap().unwrap();
        assert_eq!(ticket.user_id, user.id);

        // Weak password does not spend the token
        let err = auth.confirm_password_reset(&ticket.token, "weak").await.unwrap_err();
        assert!(matches!(err, AuthError::WeakPassword(_)));

        auth.confirm_password_reset(&ticket.token, "Pallet77Jack").await.unwrap();
        assert!(auth.sessions.get_session(&outcome.session.id).await.unwrap().is_none());
        assert_eq!(audit.count(AuditCategory::PasswordReset), 1);

        let err = auth.confirm_password_reset(&ticket.token, "Pallet88Jack").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResetToken));

        auth.login(login_request("Pallet77Jack"), DeviceInfo::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_reset_request_invalidates_previous() {
        let (auth, _, _) = registered().await;
        let first = auth.request_password_reset("yard@depot.example").await.unwrap().unwrap();
        let second = auth.request_password_reset("yard@depot.example").await.unwrap().unwrap();

        let err = auth.confirm_password_reset(&first.token, "Pallet77Jack").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResetToken));
        auth.confirm_password_reset(&second.token, "Pallet77Jack").await.unwrap();
    }

    #[tokio::test]
    async fn test_change_password_keeps_sessions() {
        let (auth, _, user) = registered().await;
        let outcome = auth.login(login_request(PASSWORD), DeviceInfo::default()).await.unwrap();

        let err = auth
            .change_password(user.id, "Wrong42Password", "Pallet77Jack")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));

        let err = auth.change_password(user.id, PASSWORD, "weak").await.unwrap_err();
        assert!(matches!(err, AuthError::WeakPassword(_)));

        auth.change_password(user.id, PASSWORD, "Pallet77Jack").await.unwrap();
        assert!(auth.sessions.get_session(&outcome.session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_session_scoped_checks() {
        let (auth, _, _) = registered().await;
        let outcome = auth.login(login_request(PASSWORD), DeviceInfo::default()).await.unwrap();
        let id = outcome.session.id.as_str();

        assert!(auth.has_permission(id, "read:reports").await.unwrap());
        assert!(!auth.has_permission(id, "write:shipments").await.unwrap());
        assert!(auth.has_role(id, "viewer").await.unwrap());
        assert!(!auth.has_any_role(id, &["manager", "operator"]).await.unwrap());

        let decision = auth
            .can_perform_action(Some("missing"), "view_shipment", None)
            .await;
        assert_eq!(decision.reason.as_deref(), Some("Session not found"));
        assert_eq!(decision.redirect_to.as_deref(), Some(LOGIN_ROUTE));
        assert!(auth.can_perform_action(Some(id), "view_shipment", None).await.allowed);
    }

    #[tokio::test]
    async fn test_pending_two_factor_grants_nothing() {
        let (auth, _, user) = registered().await;
        let enrollment = auth.setup_2fa(user.id).await.unwrap();
        let code = auth.two_factor.current_code(&enrollment.secret).unwrap();
        auth.enable_2fa(user.id, &code).await.unwrap();

        let pending = auth.login(login_request(PASSWORD), DeviceInfo::default()).await.unwrap();
        assert!(pending.two_factor_required);
        let id = pending.session.id.as_str();

        assert!(matches!(
            auth.has_permission(id, "read:reports").await,
            Err(AuthError::TwoFactorRequired)
        ));
        assert!(matches!(auth.has_role(id, "viewer").await, Err(AuthError::TwoFactorRequired)));
        assert!(matches!(
            auth.has_any_role(id, &["viewer"]).await,
            Err(AuthError::TwoFactorRequired)
        ));
        assert!(matches!(
            auth.tokens.verify_access_token(&pending.tokens.access_token),
            Err(AuthError::TwoFactorRequired)
        ));

        let code = auth.two_factor.current_code(&enrollment.secret).unwrap();
        let verified = auth.complete_two_factor(id, &code).await.unwrap();
        assert!(auth.tokens.verify_access_token(&verified.access_token).is_ok());
        assert!(auth.has_permission(id, "read:reports").await.unwrap());
        assert!(auth.has_role(id, "viewer").await.unwrap());
    }

    #[tokio::test]
    async fn test_two_factor_enable_updates_user_flag() {
        let (auth, audit, user) = registered().await;

        let enrollment = auth.setup_2fa(user.id).await.unwrap();
        let code = auth.two_factor.current_code(&enrollment.secret).unwrap();
        let backup = auth.enable_2fa(user.id, &code).await.unwrap();
        assert_eq!(backup.len(), 10);

        let stored = auth.users().get_user_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.two_factor_enabled);
        assert_eq!(audit.count(AuditCategory::TwoFactorEnabled), 1);

        assert_eq!(auth.verify_backup_code(user.id, &backup[3]).await.unwrap(), 9);
        assert!(auth.verify_backup_code(user.id, &backup[3]).await.is_err());
        assert_eq!(audit.count(AuditCategory::BackupCodeUsed), 1);
        assert_eq!(audit.count(AuditCategory::TwoFactorFailed), 1);

        let code = auth.two_factor.current_code(&enrollment.secret).unwrap();
        auth.disable_2fa(user.id, &code).await.unwrap();
        let stored = auth.users().get_user_by_id(user.id).await.unwrap().unwrap();
        assert!(!stored.two_factor_enabled);
    }
}
