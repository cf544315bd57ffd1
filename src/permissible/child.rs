//! Assignments held by a permissible: node grants and group memberships

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::namespace::Namespace;
use crate::node::PermissionValue;
use crate::references::References;

/// A grant of one permission node to a holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildPermission {
    /// Entity or group holding the grant
    pub holder: Uuid,
    /// Node being granted
    pub namespace: Namespace,
    /// Explicit value, `None` defers to the node default
    pub value: Option<PermissionValue>,
    /// Scope the grant applies in, empty for global
    pub references: References,
    /// When the grant lapses, `None` for never
    pub expiry: Option<DateTime<Utc>>,
}

impl ChildPermission {
    pub fn new(
        holder: Uuid,
        namespace: Namespace,
        value: Option<PermissionValue>,
        references: References,
        expiry: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            holder,
            namespace,
            value,
            references,
            expiry,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Explicit value, or `default` when none was assigned
    pub fn value_or(&self, default: &PermissionValue) -> PermissionValue {
        self.value.clone().unwrap_or_else(|| default.clone())
    }

    /// Same node under the same scope
    pub fn same_slot(&self, namespace: &Namespace, references: &References) -> bool {
        self.namespace == *namespace && self.references.same_scope(references)
    }
}

/// Membership of a holder in a group under a scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group: Uuid,
    pub references: References,
    pub expiry: Option<DateTime<Utc>>,
}

impl GroupMembership {
    pub fn new(group: Uuid, references: References, expiry: Option<DateTime<Utc>>) -> Self {
        Self {
            group,
            references,
            expiry,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|at| at <= now)
    }

    /// Same group under the same scope
    pub fn same_slot(&self, group: Uuid, references: &References) -> bool {
        self.group == group && self.references.same_scope(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let ns = Namespace::parse("io.amelia.user").unwrap();
        let mut grant = ChildPermission::new(Uuid::new_v4(), ns, None, References::global(), None);
        assert!(!grant.is_expired_at(now));

        grant.expiry = Some(now - Duration::seconds(1));
        assert!(grant.is_expired_at(now));

        grant.expiry = Some(now + Duration::hours(1));
        assert!(!grant.is_expired_at(now));
    }

    #[test]
    fn test_value_or_default() {
        let ns = Namespace::parse("io.amelia.user").unwrap();
        let grant = ChildPermission::new(Uuid::new_v4(), ns.clone(), None, References::global(), None);
        assert_eq!(
            grant.value_or(&PermissionValue::Bool(true)),
            PermissionValue::Bool(true)
        );

        let explicit = ChildPermission::new(
            Uuid::new_v4(),
            ns,
            Some(PermissionValue::Int(4)),
            References::global(),
            None,
        );
        assert_eq!(
            explicit.value_or(&PermissionValue::Bool(true)),
            PermissionValue::Int(4)
        );
    }

    #[test]
    fn test_same_slot_ignores_token_order() {
        let group = Uuid::new_v4();
        let membership = GroupMembership::new(group, References::parse("a,b"), None);
        assert!(membership.same_slot(group, &References::parse("b,a")));
        assert!(!membership.same_slot(group, &References::global()));
        assert!(!membership.same_slot(Uuid::new_v4(), &References::parse("a,b")));
    }
}
