//! User store seam
//!
//! Credential storage belongs to the host application; the auth core only
//! needs these four operations.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::types::{NewUser, User, UserPatch};

/// External user store
#[async_trait]
pub trait UserService: Send + Sync {
    /// Lookup is case-insensitive on email
    async fn get_user_by_email(&self, email: &str) -> AuthResult<Option<User>>;
    async fn get_user_by_id(&self, id: Uuid) -> AuthResult<Option<User>>;
    /// Fails with `EmailAlreadyExists` for a taken email
    async fn create_user(&self, user: NewUser) -> AuthResult<User>;
    async fn update_user(&self, id: Uuid, patch: UserPatch) -> AuthResult<User>;
}

/// In-memory user store
#[derive(Debug, Default)]
pub struct MemoryUserService {
    users: DashMap<Uuid, User>,
    /// Normalised email -> id
    emails: DashMap<String, Uuid>,
}

impl MemoryUserService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
impl UserService for MemoryUserService {
    async fn get_user_by_email(&self, email: &str) -> AuthResult<Option<User>> {
        let Some(id) = self.emails.get(&normalize_email(email)).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn get_user_by_id(&self, id: Uuid) -> AuthResult<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn create_user(&self, new_user: NewUser) -> AuthResult<User> {
        let email = normalize_email(&new_user.email);
        let id = Uuid::new_v4();

        // The email index entry is the uniqueness check
        match self.emails.entry(email.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(AuthError::EmailAlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let user = User {
            id,
            email,
            name: new_user.name,
            password_hash: new_user.password_hash,
            role: new_user.role,
            active: true,
            two_factor_enabled: false,
            created_at: Utc::now(),
            last_login_at: None,
        };
        self.users.insert(id, user.clone());
        Ok(user)
    }

    async fn update_user(&self, id: Uuid, patch: UserPatch) -> AuthResult<User> {
        let mut user = self.users.get_mut(&id).ok_or(AuthError::UserNotFound)?;

        if let Some(name) = patch.name {
            user.name = Some(name);
        }
        if let Some(hash) = patch.password_hash {
            user.password_hash = hash;
        }
        if let Some(role) = patch.role {
            user.role = role;
        }
        if let Some(active) = patch.active {
            user.active = active;
        }
        if let Some(enabled) = patch.two_factor_enabled {
            user.two_factor_enabled = enabled;
        }
        if let Some(at) = patch.last_login_at {
            user.last_login_at = Some(at);
        }

        Ok(user.clone())
    }
}
