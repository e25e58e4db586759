//! Session Management Service
//!
//! In-memory session lifecycle with:
//! - Cryptographically secure session ids
//! - Idle (sliding) and absolute expiry
//! - Per-user concurrent session limit with oldest-first eviction
//! - Lazy access-token rotation near expiry
//! - Snapshot persistence through a [`SessionSnapshotStore`]
//! - Periodic cleanup of expired sessions
//!
//! Sessions live in a `DashMap`; no map guard is ever held across an
//! `.await`. Store calls run after the guard is released and under
//! `store_timeout`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditSink};
use crate::config::SessionConfig;
use crate::error::{AuthError, AuthResult};
use crate::store::SessionSnapshotStore;
use crate::token::TokenService;
use crate::types::{ClaimSet, DeviceInfo, Session, SessionUser, TokenKind};

/// Destroy reason recorded when the per-user limit evicts a session
pub const REASON_CONCURRENT_LIMIT: &str = "concurrent_limit";
/// Destroy reason recorded for timed-out sessions
pub const REASON_EXPIRED: &str = "expired";
/// Destroy reason recorded for bulk revocation
pub const REASON_REVOKED: &str = "revoked";

/// Session manager
pub struct SessionManager {
    config: SessionConfig,
    tokens: TokenService,
    store: Arc<dyn SessionSnapshotStore>,
    audit: Arc<dyn AuditSink>,
    sessions: DashMap<String, Session>,
    /// Serialises creation so the per-user limit cannot be raced
    create_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        tokens: TokenService,
        store: Arc<dyn SessionSnapshotStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            tokens,
            store,
            audit,
            sessions: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Create a session, evicting the user's oldest sessions if over the limit
    pub async fn create_session(
        &self,
        user: &SessionUser,
        device_info: DeviceInfo,
    ) -> AuthResult<Session> {
        let _guard = self.create_lock.lock().await;
        let now = Utc::now();

        let mut existing: Vec<(String, DateTime<Utc>)> = self
            .sessions
            .iter()
            .filter(|e| e.user_id == user.user_id && e.is_active_at(now))
            .map(|e| (e.id.clone(), e.created_at))
            .collect();
        existing.sort_by_key(|(_, created_at)| *created_at);

        let limit = self.config.max_sessions_per_user.max(1);
        let excess = (existing.len() + 1).saturating_sub(limit);
        for (id, _) in existing.into_iter().take(excess) {
            tracing::info!(user_id = %user.user_id, session_id = %id, "Evicting oldest session");
            self.destroy_session(&id, REASON_CONCURRENT_LIMIT).await?;
        }

        let id = self.generate_id();
        let pair = self.tokens.create_token_pair(ClaimSet {
            user_id: user.user_id,
            role: user.role.clone(),
            permissions: user.permissions.clone(),
            session_id: Some(id.clone()),
            two_factor_verified: user.two_factor_verified,
        })?;

        let expires_at = now + to_chrono(self.config.lifetime)?;
        let idle_expires_at = (now + to_chrono(self.config.idle_timeout)?).min(expires_at);

        let session = Session {
            id: id.clone(),
            user_id: user.user_id,
            user_role: user.role.clone(),
            user_permissions: user.permissions.clone(),
            created_at: now,
            last_activity: now,
            expires_at,
            idle_expires_at,
            device_info,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            two_factor_verified: user.two_factor_verified,
        };

        self.sessions.insert(id.clone(), session.clone());
        match self.persist_live(&session).await {
            Ok(true) => {}
            Ok(false) => return Err(AuthError::SessionNotFound),
            Err(e) => {
                self.sessions.remove(&id);
                return Err(e);
            }
        }

        tracing::info!(
            user_id = %user.user_id,
            session_id = %id,
            two_factor_verified = user.two_factor_verified,
            "Session created"
        );
        self.audit.log(
            AuditCategory::SessionCreated,
            "Session created",
            json!({
                "session_id": id,
                "user_id": user.user_id,
                "ip_address": session.device_info.ip_address,
            }),
        );

        Ok(session)
    }

    /// Look up an active session without extending it
    pub async fn get_session(&self, id: &str) -> AuthResult<Option<Session>> {
        self.get_session_at(id, Utc::now()).await
    }

    /// [`get_session`](Self::get_session) with an explicit clock
    pub async fn get_session_at(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Session>> {
        let session = match self.sessions.get(id) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };

        if session.is_active_at(now) {
            Ok(Some(session))
        } else {
            self.evict_if_expired(id, now).await?;
            Ok(None)
        }
    }

    /// Record activity: slide the idle window and rotate a near-expiry access token
    pub async fn update_session(&self, id: &str) -> AuthResult<Session> {
        self.update_session_at(id, Utc::now()).await
    }

    /// Alias of [`update_session`](Self::update_session)
    pub async fn refresh_session(&self, id: &str) -> AuthResult<Session> {
        self.update_session(id).await
    }

    /// [`update_session`](Self::update_session) with an explicit clock
    pub async fn update_session_at(&self, id: &str, now: DateTime<Utc>) -> AuthResult<Session> {
        let idle = to_chrono(self.config.idle_timeout)?;

        let updated = match self.sessions.get_mut(id) {
            None => return Err(AuthError::SessionNotFound),
            Some(mut entry) => {
                if entry.is_active_at(now) {
                    entry.last_activity = now;
                    entry.idle_expires_at = (now + idle).min(entry.expires_at);

                    if self.needs_rotation(&entry.access_token, now) {
                        entry.access_token = self
                            .tokens
                            .create_token(claims_for(&entry), TokenKind::Access)?;
                        tracing::debug!(session_id = %id, "Access token rotated");
                    }
                    Some(entry.clone())
                } else {
                    None
                }
            }
        };

        match updated {
            Some(session) => {
                if !self.persist_live(&session).await? {
                    return Err(AuthError::SessionNotFound);
                }
                Ok(session)
            }
            None => {
                self.evict_if_expired(id, now).await?;
                Err(AuthError::SessionExpired)
            }
        }
    }

    /// Mark the session's second factor as completed
    ///
    /// Counts as activity, and re-issues both tokens so they carry the
    /// verified claim.
    pub async fn mark_two_factor_verified(&self, id: &str) -> AuthResult<Session> {
        self.mark_two_factor_verified_at(id, Utc::now()).await
    }

    /// [`mark_two_factor_verified`](Self::mark_two_factor_verified) with an explicit clock
    pub async fn mark_two_factor_verified_at(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Session> {
        let idle = to_chrono(self.config.idle_timeout)?;

        let updated = match self.sessions.get_mut(id) {
            None => return Err(AuthError::SessionNotFound),
            Some(mut entry) => {
                if entry.is_active_at(now) {
                    entry.two_factor_verified = true;
                    entry.last_activity = now;
                    entry.idle_expires_at = (now + idle).min(entry.expires_at);

                    let pair = self.tokens.create_token_pair(claims_for(&entry))?;
                    entry.access_token = pair.access_token;
                    entry.refresh_token = pair.refresh_token;
                    Some(entry.clone())
                } else {
                    None
                }
            }
        };

        match updated {
            Some(session) => {
                if !self.persist_live(&session).await? {
                    return Err(AuthError::SessionNotFound);
                }
                tracing::info!(
                    session_id = %id,
                    user_id = %session.user_id,
                    "Session 2FA verified"
                );
                Ok(session)
            }
            None => {
                self.evict_if_expired(id, now).await?;
                Err(AuthError::SessionExpired)
            }
        }
    }

    /// Destroy a session; returns `false` if it was already gone
    pub async fn destroy_session(&self, id: &str, reason: &str) -> AuthResult<bool> {
        let Some((_, session)) = self.sessions.remove(id) else {
            return Ok(false);
        };

        self.finish_destroy(&session, reason).await?;
        Ok(true)
    }

    /// Destroy every session of a user, optionally keeping one
    pub async fn destroy_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<&str>,
    ) -> AuthResult<usize> {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.user_id == user_id && Some(e.id.as_str()) != except)
            .map(|e| e.key().clone())
            .collect();

        let mut destroyed = 0;
        for id in ids {
            if self.destroy_session(&id, REASON_REVOKED).await? {
                destroyed += 1;
            }
        }

        tracing::info!(user_id = %user_id, count = destroyed, "User sessions destroyed");
        Ok(destroyed)
    }

    /// Active sessions of a user, oldest first
    pub fn list_user_sessions(&self, user_id: Uuid) -> Vec<Session> {
        let now = Utc::now();
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|e| e.user_id == user_id && e.is_active_at(now))
            .map(|e| e.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Number of sessions held, including not-yet-swept expired ones
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether a session is within both timers and carries a valid access token for itself
    ///
    /// A session still waiting on its second factor is not valid.
    pub fn is_valid_session(&self, session: &Session) -> bool {
        if !session.is_active_at(Utc::now()) {
            return false;
        }
        match self.tokens.verify_access_token(&session.access_token) {
            Ok(claims) => claims.sid.as_deref() == Some(session.id.as_str()),
            Err(_) => false,
        }
    }

    /// Remove every expired session; returns how many were removed
    pub async fn cleanup_expired(&self) -> AuthResult<usize> {
        self.cleanup_expired_at(Utc::now()).await
    }

    /// [`cleanup_expired`](Self::cleanup_expired) with an explicit clock
    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> AuthResult<usize> {
        // One shard guard at a time while collecting
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| !e.is_active_at(now))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        let mut first_error = None;
        for id in candidates {
            match self.evict_if_expired(&id, now).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        session_id = %id,
                        error = %e,
                        "Failed to remove expired session snapshot"
                    );
                    removed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        if removed > 0 {
            tracing::info!(
                removed = removed,
                remaining = self.sessions.len(),
                "Expired sessions cleaned up"
            );
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Run [`cleanup_expired`](Self::cleanup_expired) every `cleanup_interval`
    ///
    /// Abort the returned handle to stop the task.
    pub fn spawn_cleanup(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.cleanup_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if let Err(e) = self.cleanup_expired().await {
                    tracing::warn!(error = %e, "Session cleanup failed");
                }
            }
        })
    }

    /// Reload sessions from the snapshot store, dropping expired ones
    pub async fn restore(&self) -> AuthResult<usize> {
        let snapshots = self.with_deadline(self.store.load_all()).await?;
        let now = Utc::now();

        let mut restored = 0;
        for session in snapshots {
            if session.is_active_at(now) {
                self.sessions.entry(session.id.clone()).or_insert(session);
                restored += 1;
            } else {
                tracing::debug!(session_id = %session.id, "Discarding expired snapshot");
                self.with_deadline(self.store.delete(&session.id)).await?;
            }
        }

        tracing::info!(restored = restored, "Sessions restored from snapshots");
        Ok(restored)
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Remove `id` only if it is still expired at `now`
    async fn evict_if_expired(&self, id: &str, now: DateTime<Utc>) -> AuthResult<bool> {
        // Re-checked under the shard lock so a concurrent refresh wins
        let Some((_, session)) = self.sessions.remove_if(id, |_, s| !s.is_active_at(now)) else {
            return Ok(false);
        };

        self.finish_destroy(&session, REASON_EXPIRED).await?;
        Ok(true)
    }

    async fn finish_destroy(&self, session: &Session, reason: &str) -> AuthResult<()> {
        let duration_secs = session.duration_secs(Utc::now());

        tracing::info!(
            session_id = %session.id,
            user_id = %session.user_id,
            reason = reason,
            duration_secs = duration_secs,
            "Session destroyed"
        );
        self.audit.log(
            AuditCategory::SessionDestroyed,
            "Session destroyed",
            json!({
                "session_id": session.id,
                "user_id": session.user_id,
                "reason": reason,
                "duration_secs": duration_secs,
            }),
        );

        self.with_deadline(self.store.delete(&session.id)).await
    }

    /// Write the snapshot; `false` if the session was destroyed meanwhile
    ///
    /// A destroy that lands while the write is in flight has already deleted
    /// the snapshot, so the late write is undone here.
    async fn persist_live(&self, session: &Session) -> AuthResult<bool> {
        tracing::debug!(session_id = %session.id, "Persisting session snapshot");
        self.with_deadline(self.store.put(session)).await?;

        if self.sessions.contains_key(&session.id) {
            return Ok(true);
        }
        tracing::debug!(session_id = %session.id, "Session destroyed during snapshot write");
        self.with_deadline(self.store.delete(&session.id)).await?;
        Ok(false)
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = AuthResult<T>>) -> AuthResult<T> {
        tokio::time::timeout(self.config.store_timeout, fut)
            .await
            .map_err(|_| AuthError::StoreTimeout)?
    }

    fn needs_rotation(&self, access_token: &str, now: DateTime<Utc>) -> bool {
        let threshold = self.config.refresh_threshold.as_secs() as i64;
        match self.tokens.decode_token(access_token) {
            Some(claims) => claims.exp - now.timestamp() <= threshold,
            None => true,
        }
    }

    fn generate_id(&self) -> String {
        let mut bytes = vec![0u8; self.config.id_length];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(&bytes)
    }
}

fn claims_for(session: &Session) -> ClaimSet {
    ClaimSet {
        user_id: session.user_id,
        role: session.user_role.clone(),
        permissions: session.user_permissions.clone(),
        session_id: Some(session.id.clone()),
        two_factor_verified: session.two_factor_verified,
    }
}

fn to_chrono(duration: std::time::Duration) -> AuthResult<Duration> {
    Duration::from_std(duration).map_err(|e| AuthError::Config(e.to_string()))
}
