//! FleetGate Authentication & Authorization Core
//!
//! Authentication and access control for the FleetGate logistics dashboard:
//!
//! - **Tokens**: HS256-signed access + refresh tokens bound to a session
//! - **Sessions**: idle and absolute expiry, per-user limits, snapshot persistence
//! - **RBAC**: leveled role catalog with `resource:action` permissions
//! - **2FA**: TOTP (RFC 6238) with single-use backup codes
//! - **Guard**: route, component and action policies with a middleware chain
//! - **Password Security**: Argon2id hashing (OWASP parameters)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Login & Access Flow                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  login → UserService → PasswordService → TwoFactorService    │
//! │                              │                               │
//! │                              ▼                               │
//! │            SessionManager ──► TokenService                   │
//! │                   │                                          │
//! │                   ▼                                          │
//! │  request → AuthService::subject → SecurityGuard              │
//! │                                       │                      │
//! │                                       ▼                      │
//! │                          RolePermissionService               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The library never installs a `tracing` subscriber; binaries do.

pub mod audit;
pub mod config;
pub mod error;
pub mod guard;
pub mod password;
pub mod rbac;
pub mod service;
pub mod session;
pub mod state;
pub mod store;
pub mod token;
pub mod totp;
pub mod types;
pub mod user;

pub use audit::{AuditCategory, AuditRecord, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::AuthConfig;
pub use error::{AuthError, AuthResult, ErrorResponse};
pub use guard::{
    AccessContext, AccessDecision, AccessSubject, ActionPolicy, ComponentPolicy, GuardMiddleware,
    ResourceRef, RoutePolicy, SecurityGuard,
};
pub use password::PasswordService;
pub use rbac::{Permission, Role, RolePermissionService};
pub use service::AuthService;
pub use session::SessionManager;
pub use state::{transition, AuthEvent, AuthState};
pub use store::{JsonFileSnapshotStore, MemorySnapshotStore, SessionSnapshotStore};
pub use token::TokenService;
pub use totp::{MemoryTwoFactorStore, TwoFactorService, TwoFactorStore};
pub use types::*;
pub use user::{MemoryUserService, UserService};
