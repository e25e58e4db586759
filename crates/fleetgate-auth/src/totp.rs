//! Two-Factor Authentication Service
//!
//! TOTP-based second factor with:
//! - TOTP generation and verification (RFC 6238 / RFC 4226)
//! - otpauth:// provisioning URLs for authenticator apps
//! - Single-use backup codes, stored only as hashes
//!
//! The drift window is one step either side of the current step.

use async_trait::async_trait;
use base32::{decode as base32_decode, encode as base32_encode, Alphabet};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{TotpAlgorithm, TotpConfig};
use crate::error::{AuthError, AuthResult};
use crate::types::{TotpEnrollment, TwoFactorRecord};

/// Secret length in bytes (160 bits)
const SECRET_LEN: usize = 20;

/// Steps checked either side of the current one
const DRIFT_STEPS: u64 = 1;

/// No 0, O, 1, I for readability
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const B32: Alphabet = Alphabet::RFC4648 { padding: false };

// =============================================================================
// Storage
// =============================================================================

/// Per-user 2FA state storage
#[async_trait]
pub trait TwoFactorStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> AuthResult<Option<TwoFactorRecord>>;
    async fn put(&self, user_id: Uuid, record: TwoFactorRecord) -> AuthResult<()>;
    async fn delete(&self, user_id: Uuid) -> AuthResult<()>;
}

/// In-memory 2FA store
#[derive(Default)]
pub struct MemoryTwoFactorStore {
    records: DashMap<Uuid, TwoFactorRecord>,
}

impl MemoryTwoFactorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TwoFactorStore for MemoryTwoFactorStore {
    async fn get(&self, user_id: Uuid) -> AuthResult<Option<TwoFactorRecord>> {
        Ok(self.records.get(&user_id).map(|r| r.value().clone()))
    }

    async fn put(&self, user_id: Uuid, record: TwoFactorRecord) -> AuthResult<()> {
        self.records.insert(user_id, record);
        Ok(())
    }

    async fn delete(&self, user_id: Uuid) -> AuthResult<()> {
        self.records.remove(&user_id);
        Ok(())
    }
}

// =============================================================================
// Service
// =============================================================================

/// TOTP two-factor service
#[derive(Clone)]
pub struct TwoFactorService {
    config: TotpConfig,
    store: Arc<dyn TwoFactorStore>,
    /// Serialises read-modify-write of records so a backup code is consumed once
    write_lock: Arc<Mutex<()>>,
}

impl TwoFactorService {
    pub fn new(config: TotpConfig, store: Arc<dyn TwoFactorStore>) -> Self {
        Self {
            config,
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &TotpConfig {
        &self.config
    }

    /// Start enrollment: generate and store a fresh, not-yet-enabled secret
    pub async fn generate_secret_key(
        &self,
        user_id: Uuid,
        account_name: &str,
    ) -> AuthResult<TotpEnrollment> {
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.store.get(user_id).await? {
            if existing.enabled {
                return Err(AuthError::TwoFactorAlreadyEnabled);
            }
        }

        let mut secret_bytes = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = base32_encode(B32, &secret_bytes);

        self.store
            .put(
                user_id,
                TwoFactorRecord {
                    secret: secret.clone(),
                    enabled: false,
                    backup_code_hashes: Vec::new(),
                },
            )
            .await?;

        tracing::debug!(user_id = %user_id, "2FA enrollment started");

        let qr_code_url = self.otpauth_url(&secret, account_name);
        Ok(TotpEnrollment { secret, qr_code_url })
    }

    /// TOTP code for a base32 secret at a given time step (counter)
    pub fn generate_totp_code(&self, secret: &str, time_step: u64) -> AuthResult<String> {
        let key = decode_secret(secret)?;
        self.code_for_counter(&key, time_step)
    }

    /// Current TOTP code for a base32 secret
    pub fn current_code(&self, secret: &str) -> AuthResult<String> {
        self.generate_totp_code(secret, unix_now() / self.config.step)
    }

    /// Verify a TOTP code for a user against the current time
    pub async fn verify_totp_code(&self, user_id: Uuid, code: &str) -> AuthResult<()> {
        self.verify_totp_code_at(user_id, code, unix_now()).await
    }

    /// Verify a TOTP code for a user at an explicit Unix time
    pub async fn verify_totp_code_at(
        &self,
        user_id: Uuid,
        code: &str,
        unix_secs: u64,
    ) -> AuthResult<()> {
        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or(AuthError::TwoFactorSecretMissing)?;

        if self.check_code(&record.secret, code, unix_secs)? {
            Ok(())
        } else {
            tracing::warn!(user_id = %user_id, "TOTP verification failed");
            Err(AuthError::InvalidTwoFactorCode)
        }
    }

    /// Whether `code` matches `secret` within the drift window around `unix_secs`
    pub fn check_code(&self, secret: &str, code: &str, unix_secs: u64) -> AuthResult<bool> {
        let code = code.trim();
        if code.len() != self.config.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }

        let key = decode_secret(secret)?;
        let counter = unix_secs / self.config.step;
        let first = counter.saturating_sub(DRIFT_STEPS);

        // Every step in the window is computed so timing does not reveal which matched
        let mut matched = false;
        for step in first..=counter + DRIFT_STEPS {
            let expected = self.code_for_counter(&key, step)?;
            matched |= constant_time_eq(code, &expected);
        }
        Ok(matched)
    }

    /// Confirm enrollment with a valid code; returns the plaintext backup codes
    pub async fn enable_2fa(&self, user_id: Uuid, code: &str) -> AuthResult<Vec<String>> {
        let _guard = self.write_lock.lock().await;

        let mut record = self
            .store
            .get(user_id)
            .await?
            .ok_or(AuthError::TwoFactorSecretMissing)?;
        if record.enabled {
            return Err(AuthError::TwoFactorAlreadyEnabled);
        }
        if !self.check_code(&record.secret, code, unix_now())? {
            tracing::warn!(user_id = %user_id, "2FA enable rejected: bad code");
            return Err(AuthError::InvalidTwoFactorCode);
        }

        let codes = self.generate_backup_codes();
        record.enabled = true;
        record.backup_code_hashes = codes.iter().map(|c| hash_backup_code(c)).collect();
        self.store.put(user_id, record).await?;

        tracing::info!(user_id = %user_id, "2FA enabled");
        Ok(codes)
    }

    /// Turn 2FA off after verifying a current code; the secret is deleted
    pub async fn disable_2fa(&self, user_id: Uuid, code: &str) -> AuthResult<()> {
        let _guard = self.write_lock.lock().await;

        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or(AuthError::TwoFactorSecretMissing)?;
        if !record.enabled {
            return Err(AuthError::TwoFactorNotEnabled);
        }
        if !self.check_code(&record.secret, code, unix_now())? {
            tracing::warn!(user_id = %user_id, "2FA disable rejected: bad code");
            return Err(AuthError::InvalidTwoFactorCode);
        }

        self.store.delete(user_id).await?;
        tracing::info!(user_id = %user_id, "2FA disabled");
        Ok(())
    }

    /// Consume a backup code; returns how many remain
    pub async fn verify_backup_code(&self, user_id: Uuid, code: &str) -> AuthResult<usize> {
        let _guard = self.write_lock.lock().await;

        let mut record = match self.store.get(user_id).await? {
            Some(record) if record.enabled => record,
            _ => return Err(AuthError::TwoFactorNotEnabled),
        };

        let candidate = hash_backup_code(code);
        let mut position = None;
        for (idx, stored) in record.backup_code_hashes.iter().enumerate() {
            if constant_time_eq(&candidate, stored) && position.is_none() {
                position = Some(idx);
            }
        }

        let Some(idx) = position else {
            tracing::warn!(user_id = %user_id, "Backup code rejected");
            return Err(AuthError::InvalidBackupCode);
        };

        record.backup_code_hashes.remove(idx);
        let remaining = record.backup_code_hashes.len();
        self.store.put(user_id, record).await?;

        tracing::info!(user_id = %user_id, remaining = remaining, "Backup code consumed");
        Ok(remaining)
    }

    /// Replace every backup code with a fresh set
    pub async fn regenerate_backup_codes(&self, user_id: Uuid) -> AuthResult<Vec<String>> {
        let _guard = self.write_lock.lock().await;

        let mut record = match self.store.get(user_id).await? {
            Some(record) if record.enabled => record,
            _ => return Err(AuthError::TwoFactorNotEnabled),
        };

        let codes = self.generate_backup_codes();
        record.backup_code_hashes = codes.iter().map(|c| hash_backup_code(c)).collect();
        self.store.put(user_id, record).await?;

        tracing::info!(user_id = %user_id, "Backup codes regenerated");
        Ok(codes)
    }

    pub async fn is_enabled(&self, user_id: Uuid) -> AuthResult<bool> {
        Ok(self
            .store
            .get(user_id)
            .await?
            .map(|r| r.enabled)
            .unwrap_or(false))
    }

    pub async fn remaining_backup_codes(&self, user_id: Uuid) -> AuthResult<usize> {
        Ok(self
            .store
            .get(user_id)
            .await?
            .filter(|r| r.enabled)
            .map(|r| r.backup_code_hashes.len())
            .unwrap_or(0))
    }

    /// Seconds until the current code rolls over
    pub fn seconds_remaining(&self) -> u64 {
        self.config.step - (unix_now() % self.config.step)
    }

    /// Generate plaintext backup codes, formatted in groups of four
    pub fn generate_backup_codes(&self) -> Vec<String> {
        let mut rng = rand::thread_rng();
        (0..self.config.backup_codes_count)
            .map(|_| {
                let raw: Vec<u8> = (0..self.config.backup_code_length)
                    .map(|_| BACKUP_CODE_ALPHABET[rng.gen_range(0..BACKUP_CODE_ALPHABET.len())])
                    .collect();
                raw.chunks(4)
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect::<Vec<_>>()
                    .join("-")
            })
            .collect()
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    fn otpauth_url(&self, secret: &str, account_name: &str) -> String {
        let issuer = urlencoding::encode(&self.config.issuer);
        let account = urlencoding::encode(account_name);

        format!(
            "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm={}&digits={}&period={}",
            issuer,
            account,
            secret,
            issuer,
            self.config.algorithm.as_str(),
            self.config.digits,
            self.config.step,
        )
    }

    fn code_for_counter(&self, key: &[u8], counter: u64) -> AuthResult<String> {
        let counter_bytes = counter.to_be_bytes();

        let hash = match self.config.algorithm {
            TotpAlgorithm::Sha1 => hmac_digest::<Hmac<Sha1>>(key, &counter_bytes)?,
            TotpAlgorithm::Sha256 => hmac_digest::<Hmac<Sha256>>(key, &counter_bytes)?,
            TotpAlgorithm::Sha512 => hmac_digest::<Hmac<Sha512>>(key, &counter_bytes)?,
        };

        // Dynamic truncation (RFC 4226 section 5.3)
        let offset = (hash[hash.len() - 1] & 0x0f) as usize;
        let binary = (u32::from(hash[offset]) & 0x7f) << 24
            | u32::from(hash[offset + 1]) << 16
            | u32::from(hash[offset + 2]) << 8
            | u32::from(hash[offset + 3]);

        let code = binary % 10u32.pow(self.config.digits);
        Ok(format!("{:0width$}", code, width = self.config.digits as usize))
    }
}

/// SHA-256 of the normalised code (dashes stripped, upper-cased), hex encoded
pub fn hash_backup_code(code: &str) -> String {
    let normalized: String = code
        .trim()
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_uppercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

fn hmac_digest<M: Mac + hmac::digest::KeyInit>(key: &[u8], msg: &[u8]) -> AuthResult<Vec<u8>> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key).map_err(|_| AuthError::Crypto)?;
    mac.update(msg);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn decode_secret(secret: &str) -> AuthResult<Vec<u8>> {
    base32_decode(B32, secret.trim_end_matches('='))
        .filter(|key| !key.is_empty())
        .ok_or_else(|| AuthError::Internal("invalid TOTP secret encoding".to_string()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
