//! Security Guard
//!
//! Authorization decisions for the dashboard's routes, components and
//! actions. Policies combine required roles, required permissions and a
//! chain of [`GuardMiddleware`] checks evaluated in registration order.
//!
//! Decisions never error: every failure is an [`AccessDecision`] with a
//! reason and, where useful, a redirect.

use chrono::{DateTime, Timelike, Utc};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::rbac::{RolePermissionService, ADMIN_ROLE};
use crate::types::{DeviceInfo, Session};

pub const LOGIN_ROUTE: &str = "/login";
pub const TWO_FACTOR_ROUTE: &str = "/login/2fa";
pub const UNAUTHORIZED_ROUTE: &str = "/unauthorized";

// =============================================================================
// Decision Inputs & Outputs
// =============================================================================

/// The authenticated party an access check is about
#[derive(Debug, Clone)]
pub struct AccessSubject {
    pub user_id: Uuid,
    pub role: String,
    pub permissions: Vec<String>,
    pub session_id: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub two_factor_verified: bool,
    pub device: DeviceInfo,
}

impl From<&Session> for AccessSubject {
    fn from(session: &Session) -> Self {
        Self {
            user_id: session.user_id,
            role: session.user_role.clone(),
            permissions: session.user_permissions.clone(),
            session_id: Some(session.id.clone()),
            last_activity: session.last_activity,
            two_factor_verified: session.two_factor_verified,
            device: session.device_info.clone(),
        }
    }
}

/// Request-time facts
#[derive(Debug, Clone)]
pub struct AccessContext {
    pub now: DateTime<Utc>,
    pub ip: Option<IpAddr>,
    /// ISO country code
    pub location: Option<String>,
}

impl AccessContext {
    /// Context at the current time with no request facts
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            ip: None,
            location: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl Default for AccessContext {
    fn default() -> Self {
        Self::now()
    }
}

/// Outcome of an access check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub redirect_to: Option<String>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            redirect_to: None,
        }
    }

    pub fn deny(reason: impl Into<String>, redirect_to: Option<&str>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            redirect_to: redirect_to.map(str::to_string),
        }
    }

    fn or_redirect(mut self, redirect: Option<&str>) -> Self {
        if !self.allowed && self.redirect_to.is_none() {
            self.redirect_to = redirect.map(str::to_string);
        }
        self
    }

    fn with_redirect(mut self, redirect: Option<&str>) -> Self {
        if !self.allowed {
            self.redirect_to = redirect.map(str::to_string);
        }
        self
    }
}

/// A resource an action targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    pub created_by: Option<Uuid>,
}

impl ResourceRef {
    pub fn owned_by(id: impl Into<String>, owner: Uuid) -> Self {
        Self {
            id: id.into(),
            created_by: Some(owner),
        }
    }
}

// =============================================================================
// Middleware
// =============================================================================

/// Extra check run after role and permission checks pass
pub trait GuardMiddleware: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, subject: &AccessSubject, ctx: &AccessContext) -> AccessDecision;
}

/// Closure-backed middleware
pub struct FnMiddleware<F> {
    name: String,
    check: F,
}

impl<F> FnMiddleware<F>
where
    F: Fn(&AccessSubject, &AccessContext) -> AccessDecision + Send + Sync,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> GuardMiddleware for FnMiddleware<F>
where
    F: Fn(&AccessSubject, &AccessContext) -> AccessDecision + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, subject: &AccessSubject, ctx: &AccessContext) -> AccessDecision {
        (self.check)(subject, ctx)
    }
}

/// Deny when the subject has been idle longer than `max_idle`
pub struct SessionTimeoutMiddleware(pub std::time::Duration);

impl GuardMiddleware for SessionTimeoutMiddleware {
    fn name(&self) -> &str {
        "session_timeout"
    }

    fn check(&self, subject: &AccessSubject, ctx: &AccessContext) -> AccessDecision {
        let idle = (ctx.now - subject.last_activity).to_std().unwrap_or_default();
        if idle > self.0 {
            AccessDecision::deny("Session timed out", Some(LOGIN_ROUTE))
        } else {
            AccessDecision::allow()
        }
    }
}

/// Allow only clients inside one of the listed networks
pub struct IpAllowList(pub Vec<IpNetwork>);

impl IpAllowList {
    /// Parse CIDR strings such as `10.0.0.0/8`
    pub fn parse<S: AsRef<str>>(networks: &[S]) -> Result<Self, ipnetwork::IpNetworkError> {
        networks
            .iter()
            .map(|n| n.as_ref().parse::<IpNetwork>())
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl GuardMiddleware for IpAllowList {
    fn name(&self) -> &str {
        "ip_allow_list"
    }

    fn check(&self, subject: &AccessSubject, ctx: &AccessContext) -> AccessDecision {
        let ip = ctx.ip.or_else(|| {
            subject
                .device
                .ip_address
                .as_deref()
                .and_then(|ip| ip.parse::<IpAddr>().ok())
        });

        match ip {
            Some(ip) if self.0.iter().any(|net| net.contains(ip)) => AccessDecision::allow(),
            _ => AccessDecision::deny("IP address not allowed", None),
        }
    }
}

/// Allow only known device ids
pub struct DeviceAllowList(pub HashSet<String>);

impl GuardMiddleware for DeviceAllowList {
    fn name(&self) -> &str {
        "device_allow_list"
    }

    fn check(&self, subject: &AccessSubject, _ctx: &AccessContext) -> AccessDecision {
        match subject.device.device_id.as_deref() {
            Some(id) if self.0.contains(id) => AccessDecision::allow(),
            _ => AccessDecision::deny("Device not allowed", None),
        }
    }
}

/// Allow only between `start_hour` (inclusive) and `end_hour` (exclusive), UTC
///
/// A window with `start_hour > end_hour` wraps midnight.
pub struct TimeWindowMiddleware {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl GuardMiddleware for TimeWindowMiddleware {
    fn name(&self) -> &str {
        "time_window"
    }

    fn check(&self, _subject: &AccessSubject, ctx: &AccessContext) -> AccessDecision {
        let hour = ctx.now.hour();
        let inside = if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        };

        if inside {
            AccessDecision::allow()
        } else {
            AccessDecision::deny("Outside allowed hours", None)
        }
    }
}

/// Allow only listed country codes
pub struct LocationAllowList(pub HashSet<String>);

impl GuardMiddleware for LocationAllowList {
    fn name(&self) -> &str {
        "location_allow_list"
    }

    fn check(&self, subject: &AccessSubject, ctx: &AccessContext) -> AccessDecision {
        let location = ctx.location.as_deref().or(subject.device.location.as_deref());
        match location {
            Some(code) if self.0.iter().any(|c| c.eq_ignore_ascii_case(code)) => {
                AccessDecision::allow()
            }
            _ => AccessDecision::deny("Location not allowed", None),
        }
    }
}

/// Require a completed second factor
pub struct RequireTwoFactor;

impl GuardMiddleware for RequireTwoFactor {
    fn name(&self) -> &str {
        "require_two_factor"
    }

    fn check(&self, subject: &AccessSubject, _ctx: &AccessContext) -> AccessDecision {
        if subject.two_factor_verified {
            AccessDecision::allow()
        } else {
            AccessDecision::deny("Two-factor verification required", Some(TWO_FACTOR_ROUTE))
        }
    }
}

// =============================================================================
// Policies
// =============================================================================

/// Requirements for a route
#[derive(Clone, Default)]
pub struct RoutePolicy {
    /// Any one of these roles suffices
    pub required_roles: Vec<String>,
    /// All of these permissions are needed
    pub required_permissions: Vec<String>,
    pub middleware: Vec<Arc<dyn GuardMiddleware>>,
    /// Redirect for role, permission and middleware denials
    pub redirect_to: Option<String>,
}

impl RoutePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.required_roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn permissions(mut self, permissions: &[&str]) -> Self {
        self.required_permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn middleware(mut self, middleware: impl GuardMiddleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn redirect_to(mut self, route: impl Into<String>) -> Self {
        self.redirect_to = Some(route.into());
        self
    }
}

/// Requirements for a UI component
#[derive(Clone, Default)]
pub struct ComponentPolicy {
    pub required_roles: Vec<String>,
    pub required_permissions: Vec<String>,
    pub middleware: Vec<Arc<dyn GuardMiddleware>>,
    /// What to render instead when denied
    pub fallback: Option<String>,
}

impl ComponentPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.required_roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn permissions(mut self, permissions: &[&str]) -> Self {
        self.required_permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn middleware(mut self, middleware: impl GuardMiddleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }
}

/// Requirements for a named action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPolicy {
    pub permission: String,
    /// Only the resource's creator (or an admin) may act
    pub require_ownership: bool,
}

impl ActionPolicy {
    pub fn new(permission: &str) -> Self {
        Self {
            permission: permission.to_string(),
            require_ownership: false,
        }
    }

    pub fn owned(permission: &str) -> Self {
        Self {
            permission: permission.to_string(),
            require_ownership: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RoutePattern {
    Exact(String),
    /// `/prefix/*` stored without the `/*`
    Prefix(String),
}

impl RoutePattern {
    fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix("/*") {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    /// Match specificity, or `None` when the route does not match
    fn score(&self, route: &str) -> Option<usize> {
        match self {
            // Exact matches outrank every prefix
            Self::Exact(path) => (path == route).then_some(usize::MAX),
            Self::Prefix(prefix) => {
                let rest = route.strip_prefix(prefix.as_str())?;
                (rest.is_empty() || rest.starts_with('/')).then_some(prefix.len())
            }
        }
    }
}

// =============================================================================
// Guard
// =============================================================================

/// Route, component and action authorization
pub struct SecurityGuard {
    rbac: RolePermissionService,
    routes: RwLock<Vec<(RoutePattern, RoutePolicy)>>,
    components: RwLock<HashMap<String, ComponentPolicy>>,
    actions: RwLock<HashMap<String, ActionPolicy>>,
}

impl SecurityGuard {
    /// Guard with the built-in action table and no routes or components
    pub fn new(rbac: RolePermissionService) -> Self {
        Self {
            rbac,
            routes: RwLock::new(Vec::new()),
            components: RwLock::new(HashMap::new()),
            actions: RwLock::new(default_actions()),
        }
    }

    pub fn rbac(&self) -> &RolePermissionService {
        &self.rbac
    }

    /// Register a route policy; `pattern` is an exact path or `/prefix/*`
    pub fn register_route(&self, pattern: &str, policy: RoutePolicy) {
        let pattern = RoutePattern::parse(pattern);
        let mut routes = self.routes.write();
        routes.retain(|(p, _)| *p != pattern);
        routes.push((pattern, policy));
    }

    pub fn register_component(&self, name: &str, policy: ComponentPolicy) {
        self.components.write().insert(name.to_string(), policy);
    }

    pub fn register_action(&self, name: &str, policy: ActionPolicy) {
        self.actions.write().insert(name.to_string(), policy);
    }

    pub fn action_policy(&self, name: &str) -> Option<ActionPolicy> {
        self.actions.read().get(name).cloned()
    }

    /// Decide whether the subject may open `route`
    pub fn can_access_route(
        &self,
        subject: Option<&AccessSubject>,
        route: &str,
        ctx: &AccessContext,
    ) -> AccessDecision {
        let policy = {
            let routes = self.routes.read();
            routes
                .iter()
                .filter_map(|(pattern, policy)| pattern.score(route).map(|s| (s, policy)))
                .max_by_key(|(score, _)| *score)
                .map(|(_, policy)| policy.clone())
        };

        let Some(policy) = policy else {
            return AccessDecision::allow();
        };

        let redirect = policy.redirect_to.as_deref().unwrap_or(UNAUTHORIZED_ROUTE);
        let decision = match subject {
            None => AccessDecision::deny("Authentication required", Some(LOGIN_ROUTE)),
            Some(s) if !s.two_factor_verified => {
                AccessDecision::deny("Two-factor verification required", Some(TWO_FACTOR_ROUTE))
            }
            Some(s) => self
                .evaluate(
                    s,
                    &policy.required_roles,
                    &policy.required_permissions,
                    &policy.middleware,
                    ctx,
                )
                .or_redirect(Some(redirect)),
        };

        if !decision.allowed {
            tracing::debug!(
                route = route,
                user_id = ?subject.map(|s| s.user_id),
                reason = ?decision.reason,
                "Route access denied"
            );
        }
        decision
    }

    /// Decide whether the subject may see a component
    pub fn can_access_component(
        &self,
        subject: Option<&AccessSubject>,
        component: &str,
        ctx: &AccessContext,
    ) -> AccessDecision {
        let Some(policy) = self.components.read().get(component).cloned() else {
            return AccessDecision::allow();
        };

        let fallback = policy.fallback.as_deref();
        let decision = match subject {
            None => AccessDecision::deny("Authentication required", None),
            Some(s) if !s.two_factor_verified => {
                AccessDecision::deny("Two-factor verification required", None)
            }
            Some(s) => self.evaluate(
                s,
                &policy.required_roles,
                &policy.required_permissions,
                &policy.middleware,
                ctx,
            ),
        };

        decision.with_redirect(fallback)
    }

    /// Decide whether the subject may perform `action`, optionally on a resource
    pub fn can_perform_action(
        &self,
        subject: Option<&AccessSubject>,
        action: &str,
        resource: Option<&ResourceRef>,
    ) -> AccessDecision {
        let Some(subject) = subject else {
            return AccessDecision::deny("Authentication required", Some(LOGIN_ROUTE));
        };
        if !subject.two_factor_verified {
            return AccessDecision::deny("Two-factor verification required", Some(TWO_FACTOR_ROUTE));
        }

        let Some(policy) = self.action_policy(action) else {
            tracing::warn!(action = action, user_id = %subject.user_id, "Unknown action requested");
            return AccessDecision::deny("Unknown action", None);
        };

        if !self.rbac.grants(&subject.role, &subject.permissions, &policy.permission) {
            return AccessDecision::deny("Insufficient permissions", None);
        }

        if policy.require_ownership {
            let owns = resource.and_then(|r| r.created_by) == Some(subject.user_id);
            if !owns && !self.rbac.has_role(&subject.role, ADMIN_ROLE) {
                return AccessDecision::deny("Not resource owner", None);
            }
        }

        AccessDecision::allow()
    }

    fn evaluate(
        &self,
        subject: &AccessSubject,
        roles: &[String],
        permissions: &[String],
        middleware: &[Arc<dyn GuardMiddleware>],
        ctx: &AccessContext,
    ) -> AccessDecision {
        if !roles.is_empty() && !self.rbac.has_any_role(&subject.role, roles) {
            return AccessDecision::deny("Insufficient role", None);
        }

        let missing = permissions
            .iter()
            .any(|p| !self.rbac.grants(&subject.role, &subject.permissions, p));
        if missing {
            return AccessDecision::deny("Insufficient permissions", None);
        }

        for m in middleware {
            let decision = m.check(subject, ctx);
            if !decision.allowed {
                tracing::debug!(
                    middleware = m.name(),
                    reason = ?decision.reason,
                    "Guard middleware denied"
                );
                return decision;
            }
        }

        AccessDecision::allow()
    }
}

fn default_actions() -> HashMap<String, ActionPolicy> {
    [
        ("view_shipment", ActionPolicy::new("read:shipments")),
        ("create_shipment", ActionPolicy::new("write:shipments")),
        ("edit_shipment", ActionPolicy::owned("write:shipments")),
        ("delete_shipment", ActionPolicy::owned("delete:shipments")),
        ("adjust_inventory", ActionPolicy::new("write:warehouse")),
        ("transfer_stock", ActionPolicy::new("write:warehouse")),
        ("assign_vehicle", ActionPolicy::new("write:fleet")),
        ("create_order", ActionPolicy::new("write:orders")),
        ("edit_order", ActionPolicy::owned("write:orders")),
        ("approve_order", ActionPolicy::new("approve:orders")),
        ("export_report", ActionPolicy::new("export:reports")),
        ("manage_users", ActionPolicy::new("manage:users")),
        ("edit_settings", ActionPolicy::new("manage:settings")),
        ("view_audit_log", ActionPolicy::new("read:audit")),
    ]
    .into_iter()
    .map(|(name, policy)| (name.to_string(), policy))
    .collect()
}
