//! Role-based access control: block-list, identity → role table, room allow-list.
//!
//! Both checks are total and fail closed: anything that cannot be evaluated
//! (e.g. an empty identity or room id) yields a deny with [`AccessReason::Error`].

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{Identity, Permission, Role, RoomId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    AccessGranted,
    NoRestrictions,
    UserBlocked,
    InsufficientPermissions,
    RoomNotAllowed,
    Error,
}

impl AccessReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessReason::AccessGranted => "access_granted",
            AccessReason::NoRestrictions => "no_restrictions",
            AccessReason::UserBlocked => "user_blocked",
            AccessReason::InsufficientPermissions => "insufficient_permissions",
            AccessReason::RoomNotAllowed => "room_not_allowed",
            AccessReason::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserAccess {
    pub allowed: bool,
    pub reason: AccessReason,
    pub role: Option<Role>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomAccess {
    pub allowed: bool,
    pub reason: AccessReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessStats {
    pub assigned_users: usize,
    pub allowed_rooms: usize,
    pub blocked_users: usize,
}

/// Static access tables, loaded once at startup.
#[derive(Clone, Debug, Default)]
pub struct AccessTables {
    pub roles: HashMap<Identity, Role>,
    pub rooms: HashMap<RoomId, Vec<Permission>>,
    pub blocked: HashSet<Identity>,
}

#[derive(Clone, Debug)]
pub struct AccessController {
    tables: AccessTables,
}

impl AccessController {
    pub fn new(tables: AccessTables) -> Self {
        Self { tables }
    }

    pub fn role_of(&self, identity: &Identity) -> Role {
        self.tables
            .roles
            .get(identity)
            .copied()
            .unwrap_or(Role::Guest)
    }

    pub fn is_blocked(&self, identity: &Identity) -> bool {
        self.tables.blocked.contains(identity)
    }

    pub fn check_user_access(&self, identity: &Identity, required: &Permission) -> UserAccess {
        if identity.as_str().trim().is_empty() {
            warn!("access check with empty identity, denying");
            return UserAccess {
                allowed: false,
                reason: AccessReason::Error,
                role: None,
            };
        }

        if self.is_blocked(identity) {
            warn!(%identity, "access denied: user blocked");
            return UserAccess {
                allowed: false,
                reason: AccessReason::UserBlocked,
                role: None,
            };
        }

        let role = self.role_of(identity);
        if role.grants(required) {
            debug!(%identity, %role, permission = %required, "access granted");
            return UserAccess {
                allowed: true,
                reason: AccessReason::AccessGranted,
                role: Some(role),
            };
        }

        warn!(%identity, %role, permission = %required, "access denied: insufficient permissions");
        UserAccess {
            allowed: false,
            reason: AccessReason::InsufficientPermissions,
            role: Some(role),
        }
    }

    pub fn check_room_access(&self, room: &RoomId, required: &Permission) -> RoomAccess {
        if room.as_str().trim().is_empty() {
            warn!("room check with empty room id, denying");
            return RoomAccess {
                allowed: false,
                reason: AccessReason::Error,
            };
        }

        if self.tables.rooms.is_empty() {
            return RoomAccess {
                allowed: true,
                reason: AccessReason::NoRestrictions,
            };
        }

        let Some(perms) = self.tables.rooms.get(room) else {
            warn!(%room, "room not in allow-list");
            return RoomAccess {
                allowed: false,
                reason: AccessReason::RoomNotAllowed,
            };
        };

        if perms.iter().any(|p| p.is_all() || p == required) {
            return RoomAccess {
                allowed: true,
                reason: AccessReason::AccessGranted,
            };
        }

        warn!(%room, permission = %required, "room lacks permission");
        RoomAccess {
            allowed: false,
            reason: AccessReason::InsufficientPermissions,
        }
    }

    pub fn stats(&self) -> AccessStats {
        AccessStats {
            assigned_users: self.tables.roles.len(),
            allowed_rooms: self.tables.rooms.len(),
            blocked_users: self.tables.blocked.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s)
    }

    fn controller() -> AccessController {
        let mut t = AccessTables::default();
        t.roles.insert(id("@root:x"), Role::Admin);
        t.roles.insert(id("@mod:x"), Role::Moderator);
        t.roles.insert(id("@alice:x"), Role::User);
        t.roles.insert(id("@blocked:x"), Role::Admin);
        t.blocked.insert(id("@blocked:x"));
        AccessController::new(t)
    }

    #[test]
    fn blocked_users_are_denied_regardless_of_role() {
        let ac = controller();
        for perm in [Permission::HELP, Permission::READ, Permission::ALL] {
            let res = ac.check_user_access(&id("@blocked:x"), &perm);
            assert!(!res.allowed);
            assert_eq!(res.reason, AccessReason::UserBlocked);
            assert_eq!(res.role, None);
        }
    }

    #[test]
    fn unassigned_identities_are_guests() {
        let ac = controller();
        assert_eq!(ac.role_of(&id("@stranger:x")), Role::Guest);

        let help = ac.check_user_access(&id("@stranger:x"), &Permission::HELP);
        assert!(help.allowed);
        assert_eq!(help.role, Some(Role::Guest));

        let read = ac.check_user_access(&id("@stranger:x"), &Permission::READ);
        assert!(!read.allowed);
        assert_eq!(read.reason, AccessReason::InsufficientPermissions);
    }

    #[test]
    fn admin_all_grants_everything() {
        let ac = controller();
        let res = ac.check_user_access(&id("@root:x"), &Permission::parse("deploy").unwrap());
        assert!(res.allowed);
        assert_eq!(res.role, Some(Role::Admin));
    }

    #[test]
    fn empty_identity_fails_closed() {
        let ac = controller();
        let res = ac.check_user_access(&id(""), &Permission::HELP);
        assert!(!res.allowed);
        assert_eq!(res.reason, AccessReason::Error);
    }

    #[test]
    fn rooms_without_allow_list_are_open() {
        let ac = controller();
        let res = ac.check_room_access(&RoomId::new("!any:x"), &Permission::WRITE);
        assert!(res.allowed);
        assert_eq!(res.reason, AccessReason::NoRestrictions);
    }

    #[test]
    fn empty_room_fails_closed_without_allow_list() {
        let ac = controller();
        let res = ac.check_room_access(&RoomId::new(" "), &Permission::READ);
        assert!(!res.allowed);
        assert_eq!(res.reason, AccessReason::Error);
    }

    #[test]
    fn room_allow_list_is_enforced() {
        let mut t = AccessTables::default();
        t.rooms
            .insert(RoomId::new("!ops:x"), vec![Permission::READ, Permission::WRITE]);
        t.rooms.insert(RoomId::new("!lobby:x"), vec![Permission::READ]);
        t.rooms.insert(RoomId::new("!admin:x"), vec![Permission::ALL]);
        let ac = AccessController::new(t);

        assert!(ac.check_room_access(&RoomId::new("!ops:x"), &Permission::WRITE).allowed);
        assert_eq!(
            ac.check_room_access(&RoomId::new("!lobby:x"), &Permission::WRITE).reason,
            AccessReason::InsufficientPermissions
        );
        assert_eq!(
            ac.check_room_access(&RoomId::new("!other:x"), &Permission::READ).reason,
            AccessReason::RoomNotAllowed
        );
        assert!(ac.check_room_access(&RoomId::new("!admin:x"), &Permission::SEARCH).allowed);
        assert_eq!(
            ac.check_room_access(&RoomId::new(""), &Permission::READ).reason,
            AccessReason::Error
        );
    }

    #[test]
    fn stats_count_tables() {
        let s = controller().stats();
        assert_eq!(s.assigned_users, 4);
        assert_eq!(s.blocked_users, 1);
        assert_eq!(s.allowed_rooms, 0);
    }
}
