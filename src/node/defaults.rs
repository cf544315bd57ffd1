//! Built-in permission nodes seeded into every registry

use super::tree::PermissionTree;
use super::value::PermissionValue;
use crate::namespace::Namespace;

/// Nodes every install carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionDefault {
    /// Fallback node consulted by callers with no specific permission
    Default,
    /// Granted to everyone
    Everybody,
    /// Operator status
    Op,
    /// Administrative access
    Admin,
    /// Entity is banned
    Banned,
    /// Entity is whitelisted
    Whitelisted,
    /// May query permission state of others
    Query,
}

impl PermissionDefault {
    pub const ALL: [PermissionDefault; 7] = [
        PermissionDefault::Default,
        PermissionDefault::Everybody,
        PermissionDefault::Op,
        PermissionDefault::Admin,
        PermissionDefault::Banned,
        PermissionDefault::Whitelisted,
        PermissionDefault::Query,
    ];

    pub fn name_space(&self) -> &'static str {
        match self {
            PermissionDefault::Default => "default",
            PermissionDefault::Everybody => "everybody",
            PermissionDefault::Op => "sys.op",
            PermissionDefault::Admin => "sys.admin",
            PermissionDefault::Banned => "sys.banned",
            PermissionDefault::Whitelisted => "sys.whitelisted",
            PermissionDefault::Query => "sys.query",
        }
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::from_segments(self.name_space().split('.').map(str::to_string).collect())
    }

    pub fn default_value(&self) -> PermissionValue {
        PermissionValue::Bool(matches!(self, PermissionDefault::Everybody))
    }

    pub fn description(&self) -> &'static str {
        match self {
            PermissionDefault::Default => "Used as the default permission node when none is specified",
            PermissionDefault::Everybody => "Granted to every entity",
            PermissionDefault::Op => "Indicates operator status, all permissions resolve true when ops are allowed",
            PermissionDefault::Admin => "Grants access to administrative functions",
            PermissionDefault::Banned => "Entity is banned and denied all access",
            PermissionDefault::Whitelisted => "Entity passes the whitelist check",
            PermissionDefault::Query => "Allows querying the permission state of other entities",
        }
    }

    /// Create every default node that is missing and describe it
    pub fn seed(tree: &mut PermissionTree) {
        for default in Self::ALL {
            let ns = default.namespace();
            if tree.create_node(&ns, default.default_value()).is_ok() {
                tree.set_description(&ns, default.description());
            }
        }
    }
}
