//! Per-command policy: which permission a command needs, which roles may run
//! it, whether it takes a free-text argument, and its rate-limit override.

use std::collections::HashMap;

use crate::domain::{Permission, Role};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionPolicy {
    pub permission: Permission,
    /// `None` means every role.
    pub roles: Option<Vec<Role>>,
    pub requires_args: bool,
    pub rate_limit: Option<u32>,
}

impl ActionPolicy {
    fn open(permission: Permission) -> Self {
        Self {
            permission,
            roles: None,
            requires_args: false,
            rate_limit: None,
        }
    }

    fn restricted(permission: Permission, roles: &[Role]) -> Self {
        Self {
            permission,
            roles: Some(roles.to_vec()),
            requires_args: false,
            rate_limit: None,
        }
    }

    fn with_args(mut self) -> Self {
        self.requires_args = true;
        self
    }

    /// Policy applied to actions missing from the catalog.
    pub fn admin_only() -> Self {
        Self::restricted(Permission::ALL, &[Role::Admin])
    }

    pub fn allows_role(&self, role: Role) -> bool {
        match &self.roles {
            None => true,
            Some(roles) => roles.contains(&role),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ActionCatalog {
    actions: HashMap<String, ActionPolicy>,
    fallback: ActionPolicy,
}

impl Default for ActionCatalog {
    fn default() -> Self {
        const MEMBERS: &[Role] = &[Role::User, Role::Moderator, Role::Admin];

        let mut actions = HashMap::new();
        actions.insert("help".to_string(), ActionPolicy::open(Permission::HELP));
        actions.insert(
            "ping".to_string(),
            ActionPolicy::restricted(Permission::READ, MEMBERS),
        );
        actions.insert(
            "status".to_string(),
            ActionPolicy::restricted(Permission::READ, MEMBERS),
        );
        for name in ["ask", "find", "search", "read"] {
            actions.insert(
                name.to_string(),
                ActionPolicy::restricted(Permission::READ, MEMBERS).with_args(),
            );
        }
        actions.insert(
            "admin_metrics".to_string(),
            ActionPolicy::restricted(Permission::WRITE, &[Role::Moderator, Role::Admin]),
        );
        for name in ["admin_cache_clear", "admin_config", "admin_restart"] {
            actions.insert(name.to_string(), ActionPolicy::admin_only());
        }

        Self {
            actions,
            fallback: ActionPolicy::admin_only(),
        }
    }
}

impl ActionCatalog {
    pub fn get(&self, action: &str) -> &ActionPolicy {
        self.actions.get(action).unwrap_or(&self.fallback)
    }

    pub fn is_known(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    /// Apply per-action request limits (`SECURITY_RATE_LIMITS`).
    pub fn with_rate_limits(mut self, limits: &HashMap<String, u32>) -> Self {
        for (name, limit) in limits {
            if let Some(policy) = self.actions.get_mut(name) {
                policy.rate_limit = Some(*limit);
            }
        }
        self
    }
}
