//! Role & Permission Service
//!
//! Static RBAC catalog for the dashboard:
//! - Roles carry a numeric level; higher is more privileged
//! - Permissions are `resource:action` codes
//! - `admin` and the blanket `read:all` permission satisfy every check
//!
//! This is the only place the admin/wildcard rule lives. Guards and session
//! checks call [`RolePermissionService::grants`] instead of re-implementing it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{AuthError, AuthResult};

/// Code of the top-level role
pub const ADMIN_ROLE: &str = "admin";

/// Blanket permission that satisfies every permission check
pub const WILDCARD_PERMISSION: &str = "read:all";

/// Role definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub code: String,
    pub name: String,
    pub description: String,
    /// Hierarchy level; higher = more privileged
    pub level: u32,
    pub permissions: BTreeSet<String>,
}

impl Role {
    pub fn new(
        code: &str,
        name: &str,
        description: &str,
        level: u32,
        permissions: &[&str],
    ) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            level,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Partial role update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub level: Option<u32>,
    pub permissions: Option<BTreeSet<String>>,
}

/// Permission definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// `resource:action`
    pub code: String,
    pub name: String,
    pub description: String,
}

impl Permission {
    fn new(code: &str, name: &str, description: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            description: description.to_string(),
        }
    }

    /// Resource half of the code
    pub fn resource(&self) -> &str {
        self.code.split_once(':').map(|(_, r)| r).unwrap_or(&self.code)
    }

    /// Action half of the code
    pub fn action(&self) -> &str {
        self.code.split_once(':').map(|(a, _)| a).unwrap_or("")
    }
}

#[derive(Debug)]
struct Catalog {
    roles: HashMap<String, Role>,
    permissions: HashMap<String, Permission>,
}

/// RBAC catalog and hierarchy checks
///
/// Reads take a shared lock; catalog mutation is rare and takes the
/// exclusive lock briefly.
#[derive(Clone)]
pub struct RolePermissionService {
    catalog: Arc<RwLock<Catalog>>,
}

impl Default for RolePermissionService {
    fn default() -> Self {
        Self::new()
    }
}

impl RolePermissionService {
    /// Create a service loaded with the built-in catalog
    pub fn new() -> Self {
        Self::with_catalog(default_roles(), default_permissions())
    }

    /// Create a service from an explicit catalog
    pub fn with_catalog(roles: Vec<Role>, permissions: Vec<Permission>) -> Self {
        let catalog = Catalog {
            roles: roles.into_iter().map(|r| (r.code.clone(), r)).collect(),
            permissions: permissions.into_iter().map(|p| (p.code.clone(), p)).collect(),
        };
        Self {
            catalog: Arc::new(RwLock::new(catalog)),
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn get_role_by_code(&self, code: &str) -> Option<Role> {
        self.catalog.read().roles.get(code).cloned()
    }

    /// Permissions of a role; empty for unknown codes
    pub fn get_role_permissions(&self, code: &str) -> BTreeSet<String> {
        self.catalog
            .read()
            .roles
            .get(code)
            .map(|r| r.permissions.clone())
            .unwrap_or_default()
    }

    /// Hierarchy level of a role, if known
    pub fn role_level(&self, code: &str) -> Option<u32> {
        self.catalog.read().roles.get(code).map(|r| r.level)
    }

    /// All roles, most privileged first
    pub fn list_roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.catalog.read().roles.values().cloned().collect();
        roles.sort_by(|a, b| b.level.cmp(&a.level).then_with(|| a.code.cmp(&b.code)));
        roles
    }

    /// All permissions, sorted by code
    pub fn list_permissions(&self) -> Vec<Permission> {
        let mut permissions: Vec<Permission> =
            self.catalog.read().permissions.values().cloned().collect();
        permissions.sort_by(|a, b| a.code.cmp(&b.code));
        permissions
    }

    pub fn get_permission(&self, code: &str) -> Option<Permission> {
        self.catalog.read().permissions.get(code).cloned()
    }

    // =========================================================================
    // Checks
    // =========================================================================

    /// Whether `role` grants `permission`
    pub fn has_permission(&self, role: &str, permission: &str) -> bool {
        if role == ADMIN_ROLE {
            return true;
        }
        let catalog = self.catalog.read();
        catalog
            .roles
            .get(role)
            .map(|r| set_grants(r.permissions.iter().map(String::as_str), permission))
            .unwrap_or(false)
    }

    /// Whether a role plus a permission snapshot grants `permission`
    ///
    /// Sessions carry the permissions captured at login; this applies the same
    /// admin/wildcard rule to that snapshot.
    pub fn grants<S: AsRef<str>>(&self, role: &str, granted: &[S], permission: &str) -> bool {
        role == ADMIN_ROLE || set_grants(granted.iter().map(AsRef::as_ref), permission)
    }

    /// Whether `user_role` satisfies `required_role` in the hierarchy
    pub fn has_role(&self, user_role: &str, required_role: &str) -> bool {
        if user_role == required_role || user_role == ADMIN_ROLE {
            return true;
        }
        let catalog = self.catalog.read();
        match (catalog.roles.get(user_role), catalog.roles.get(required_role)) {
            (Some(user), Some(required)) => user.level >= required.level,
            _ => false,
        }
    }

    pub fn has_any_role<S: AsRef<str>>(&self, user_role: &str, roles: &[S]) -> bool {
        roles.iter().any(|r| self.has_role(user_role, r.as_ref()))
    }

    pub fn has_all_permissions<S: AsRef<str>>(&self, role: &str, permissions: &[S]) -> bool {
        permissions.iter().all(|p| self.has_permission(role, p.as_ref()))
    }

    pub fn has_any_permission<S: AsRef<str>>(&self, role: &str, permissions: &[S]) -> bool {
        permissions.iter().any(|p| self.has_permission(role, p.as_ref()))
    }

    /// Whether `manager` may administer `target` (strictly higher level)
    pub fn can_manage_role(&self, manager: &str, target: &str) -> bool {
        let catalog = self.catalog.read();
        match (catalog.roles.get(manager), catalog.roles.get(target)) {
            (Some(m), Some(t)) => m.level > t.level,
            _ => false,
        }
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Add a new role to the catalog
    pub fn create_role(&self, role: Role) -> AuthResult<Role> {
        if role.code.trim().is_empty() {
            return Err(AuthError::InvalidRole("role code must not be empty".to_string()));
        }

        let mut catalog = self.catalog.write();
        if catalog.roles.contains_key(&role.code) {
            return Err(AuthError::RoleAlreadyExists(role.code));
        }
        check_permissions_known(&catalog, &role.permissions)?;
        check_below_admin(&catalog, &role.code, role.level)?;

        catalog.roles.insert(role.code.clone(), role.clone());
        tracing::info!(role = %role.code, level = role.level, "Role created");
        Ok(role)
    }

    /// Update an existing role
    pub fn update_role(&self, code: &str, update: RoleUpdate) -> AuthResult<Role> {
        let mut catalog = self.catalog.write();

        if let Some(ref permissions) = update.permissions {
            check_permissions_known(&catalog, permissions)?;
        }
        if let Some(level) = update.level {
            check_below_admin(&catalog, code, level)?;
        }
        if code == ADMIN_ROLE {
            if let Some(level) = update.level {
                let outranked = catalog
                    .roles
                    .values()
                    .any(|r| r.code != ADMIN_ROLE && r.level >= level);
                if outranked {
                    return Err(AuthError::ProtectedRole(code.to_string()));
                }
            }
        }

        let role = catalog
            .roles
            .get_mut(code)
            .ok_or_else(|| AuthError::RoleNotFound(code.to_string()))?;

        if let Some(name) = update.name {
            role.name = name;
        }
        if let Some(description) = update.description {
            role.description = description;
        }
        if let Some(level) = update.level {
            role.level = level;
        }
        if let Some(permissions) = update.permissions {
            role.permissions = permissions;
        }

        tracing::info!(role = %code, "Role updated");
        Ok(role.clone())
    }

    /// Remove a role; the admin role cannot be deleted
    pub fn delete_role(&self, code: &str) -> AuthResult<Role> {
        if code == ADMIN_ROLE {
            return Err(AuthError::ProtectedRole(code.to_string()));
        }

        let removed = self
            .catalog
            .write()
            .roles
            .remove(code)
            .ok_or_else(|| AuthError::RoleNotFound(code.to_string()))?;

        tracing::info!(role = %code, "Role deleted");
        Ok(removed)
    }
}

fn set_grants<'a>(mut granted: impl Iterator<Item = &'a str>, permission: &str) -> bool {
    granted.any(|p| p == permission || p == WILDCARD_PERMISSION)
}

fn check_permissions_known(catalog: &Catalog, permissions: &BTreeSet<String>) -> AuthResult<()> {
    match permissions.iter().find(|p| !catalog.permissions.contains_key(*p)) {
        Some(unknown) => Err(AuthError::UnknownPermission(unknown.clone())),
        None => Ok(()),
    }
}

/// Only the admin role may sit at or above the admin level
fn check_below_admin(catalog: &Catalog, code: &str, level: u32) -> AuthResult<()> {
    if code == ADMIN_ROLE {
        return Ok(());
    }
    match catalog.roles.get(ADMIN_ROLE) {
        Some(admin) if level >= admin.level => Err(AuthError::ProtectedRole(code.to_string())),
        _ => Ok(()),
    }
}

// =============================================================================
// Built-in Catalog
// =============================================================================

fn default_permissions() -> Vec<Permission> {
    vec![
        Permission::new(WILDCARD_PERMISSION, "All access", "Satisfies every permission check"),
        Permission::new("read:shipments", "View shipments", "List and inspect shipments"),
        Permission::new("write:shipments", "Edit shipments", "Create and update shipments"),
        Permission::new("delete:shipments", "Delete shipments", "Remove shipments"),
        Permission::new("read:warehouse", "View warehouse", "Inspect warehouse stock and zones"),
        Permission::new("write:warehouse", "Edit warehouse", "Adjust stock, zones and transfers"),
        Permission::new("read:fleet", "View fleet", "Inspect vehicles and drivers"),
        Permission::new("write:fleet", "Edit fleet", "Assign vehicles and routes"),
        Permission::new("read:orders", "View orders", "List and inspect orders"),
        Permission::new("write:orders", "Edit orders", "Create and update orders"),
        Permission::new("approve:orders", "Approve orders", "Approve pending orders"),
        Permission::new("read:reports", "View reports", "Open dashboards and reports"),
        Permission::new("export:reports", "Export reports", "Download report data"),
        Permission::new("manage:users", "Manage users", "Create, edit and disable users"),
        Permission::new("manage:roles", "Manage roles", "Edit the role catalog"),
        Permission::new("manage:settings", "Manage settings", "Change system settings"),
        Permission::new("read:audit", "View audit log", "Read the security audit trail"),
    ]
}

fn default_roles() -> Vec<Role> {
    vec![
        Role::new(ADMIN_ROLE, "Administrator", "Full system access", 100, &[WILDCARD_PERMISSION]),
        Role::new(
            "manager",
            "Manager",
            "Runs operations and approves orders",
            80,
            &[
                "read:shipments",
                "write:shipments",
                "delete:shipments",
                "read:warehouse",
                "write:warehouse",
                "read:fleet",
                "write:fleet",
                "read:orders",
                "write:orders",
                "approve:orders",
                "read:reports",
                "export:reports",
                "manage:users",
                "read:audit",
            ],
        ),
        Role::new(
            "dispatcher",
            "Dispatcher",
            "Plans routes and assigns vehicles",
            60,
            &[
                "read:shipments",
                "write:shipments",
                "read:fleet",
                "write:fleet",
                "read:orders",
                "read:reports",
            ],
        ),
        Role::new(
            "operator",
            "Warehouse Operator",
            "Handles stock and shipments on the floor",
            40,
            &[
                "read:shipments",
                "write:shipments",
                "read:warehouse",
                "write:warehouse",
                "read:orders",
            ],
        ),
        Role::new(
            "driver",
            "Driver",
            "Sees assigned shipments",
            20,
            &["read:shipments", "read:fleet"],
        ),
        Role::new(
            "viewer",
            "Viewer",
            "Read-only dashboard access",
            10,
            &["read:shipments", "read:reports"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_catalog_lookups() {
        let rbac = RolePermissionService::new();

        assert_eq!(rbac.get_role_by_code("manager").unwrap().level, 80);
        assert!(rbac.get_role_permissions("operator").contains("write:warehouse"));
        assert!(rbac.get_role_permissions("nonexistent").is_empty());
        assert_eq!(rbac.list_roles().first().unwrap().code, ADMIN_ROLE);

        let perm = rbac.get_permission("write:warehouse").unwrap();
        assert_eq!(perm.action(), "write");
        assert_eq!(perm.resource(), "warehouse");
    }

    #[test]
    fn test_has_permission() {
        let rbac = RolePermissionService::new();

        assert!(rbac.has_permission("operator", "write:warehouse"));
        assert!(!rbac.has_permission("operator", "approve:orders"));
        assert!(rbac.has_permission(ADMIN_ROLE, "manage:roles"));
        assert!(rbac.has_permission(ADMIN_ROLE, "something:undeclared"));
        assert!(!rbac.has_permission("ghost", "read:shipments"));
    }

    #[test]
    fn test_wildcard_permission_on_custom_role() {
        let rbac = RolePermissionService::new();
        rbac.create_role(Role::new("auditor", "Auditor", "", 30, &[WILDCARD_PERMISSION]))
            .unwrap();
        assert!(rbac.has_permission("auditor", "manage:settings"));
    }

    #[test]
    fn test_grants_on_snapshot() {
        let rbac = RolePermissionService::new();
        let snapshot = vec!["read:shipments".to_string()];

        assert!(rbac.grants("viewer", &snapshot, "read:shipments"));
        assert!(!rbac.grants("viewer", &snapshot, "write:shipments"));
        assert!(rbac.grants(ADMIN_ROLE, &Vec::<String>::new(), "write:shipments"));
        assert!(rbac.grants("viewer", &[WILDCARD_PERMISSION], "write:shipments"));
    }

    #[test]
    fn test_has_role_hierarchy() {
        let rbac = RolePermissionService::new();

        assert!(rbac.has_role("manager", "operator"));
        assert!(!rbac.has_role("operator", "manager"));
        assert!(rbac.has_role("operator", "operator"));
        assert!(rbac.has_role(ADMIN_ROLE, "anything"));
        assert!(!rbac.has_role("ghost", "viewer"));
        assert!(rbac.has_any_role("dispatcher", &["manager", "operator"]));
        assert!(!rbac.has_any_role("driver", &["manager", "operator"]));
    }

    #[test]
    fn test_permission_combinators() {
        let rbac = RolePermissionService::new();
        assert!(rbac.has_all_permissions("operator", &["read:orders", "write:warehouse"]));
        assert!(!rbac.has_all_permissions("operator", &["read:orders", "approve:orders"]));
        assert!(rbac.has_any_permission("operator", &["approve:orders", "read:orders"]));
    }

    #[test]
    fn test_can_manage_role_is_strict() {
        let rbac = RolePermissionService::new();
        assert!(rbac.can_manage_role("manager", "operator"));
        assert!(!rbac.can_manage_role("manager", "manager"));
        assert!(!rbac.can_manage_role("operator", "manager"));
        assert!(!rbac.can_manage_role("ghost", "viewer"));
    }

    #[test]
    fn test_create_role_rejects_duplicates_and_unknown_permissions() {
        let rbac = RolePermissionService::new();

        let err = rbac
            .create_role(Role::new("manager", "Dup", "", 50, &[]))
            .unwrap_err();
        assert!(matches!(err, AuthError::RoleAlreadyExists(_)));

        let err = rbac
            .create_role(Role::new("clerk", "Clerk", "", 15, &["fly:drones"]))
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownPermission(p) if p == "fly:drones"));

        let err = rbac.create_role(Role::new(" ", "Blank", "", 15, &[])).unwrap_err();
        assert!(matches!(err, AuthError::InvalidRole(_)));
    }

    #[test]
    fn test_update_and_delete_role() {
        let rbac = RolePermissionService::new();

        let updated = rbac
            .update_role(
                "driver",
                RoleUpdate {
                    level: Some(25),
                    permissions: Some(BTreeSet::from(["read:fleet".to_string()])),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.level, 25);
        assert!(!rbac.has_permission("driver", "read:shipments"));

        rbac.delete_role("driver").unwrap();
        assert!(rbac.get_role_by_code("driver").is_none());
        assert!(matches!(rbac.delete_role("driver"), Err(AuthError::RoleNotFound(_))));
    }

    #[test]
    fn test_admin_role_is_protected() {
        let rbac = RolePermissionService::new();

        assert!(matches!(rbac.delete_role(ADMIN_ROLE), Err(AuthError::ProtectedRole(_))));
        assert!(matches!(
            rbac.update_role(ADMIN_ROLE, RoleUpdate { level: Some(50), ..Default::default() }),
            Err(AuthError::ProtectedRole(_))
        ));
        assert!(rbac.get_role_by_code(ADMIN_ROLE).is_some());
    }

    #[test]
    fn test_no_role_reaches_admin_level() {
        let rbac = RolePermissionService::new();
        let admin_level = rbac.role_level(ADMIN_ROLE).unwrap();

        let err = rbac
            .create_role(Role::new("overlord", "Overlord", "", admin_level, &[]))
            .unwrap_err();
        assert!(matches!(err, AuthError::ProtectedRole(code) if code == "overlord"));
        assert!(rbac.get_role_by_code("overlord").is_none());

        let err = rbac
            .update_role(
                "manager",
                RoleUpdate {
                    level: Some(admin_level + 1),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, AuthError::ProtectedRole(_)));
        assert_eq!(rbac.role_level("manager"), Some(80));
        assert!(rbac.can_manage_role(ADMIN_ROLE, "manager"));

        rbac.create_role(Role::new("supervisor", "Supervisor", "", admin_level - 1, &[]))
            .unwrap();
        assert!(rbac.can_manage_role(ADMIN_ROLE, "supervisor"));
    }

    fn role_code() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            ADMIN_ROLE,
            "manager",
            "dispatcher",
            "operator",
            "driver",
            "viewer",
        ])
    }

    proptest! {
        #[test]
        fn prop_has_role_is_monotonic(a in role_code(), b in role_code()) {
            let rbac = RolePermissionService::new();
            let level_a = rbac.role_level(a).unwrap();
            let level_b = rbac.role_level(b).unwrap();
            if level_a >= level_b {
                prop_assert!(rbac.has_role(a, b));
            }
            prop_assert!(rbac.has_role(ADMIN_ROLE, b));
        }

        #[test]
        fn prop_manage_implies_has_role(a in role_code(), b in role_code()) {
            let rbac = RolePermissionService::new();
            if rbac.can_manage_role(a, b) {
                prop_assert!(rbac.has_role(a, b));
                prop_assert!(!rbac.can_manage_role(b, a));
            }
        }
    }
}
