//! Permissibles - entities and groups that hold assignments
//!
//! Both kinds share one state block guarded by a reader/writer lock, so a
//! cached `Arc` can be checked by many tasks while an administrative call
//! mutates or reloads it in place.

mod child;

pub use child::{ChildPermission, GroupMembership};

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::namespace::Namespace;
use crate::node::PermissionValue;
use crate::references::References;

/// Whether a permissible is a user entity or a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissibleKind {
    Entity,
    Group,
}

impl fmt::Display for PermissibleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissibleKind::Entity => write!(f, "entity"),
            PermissibleKind::Group => write!(f, "group"),
        }
    }
}

impl FromStr for PermissibleKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "entity" => Ok(PermissibleKind::Entity),
            "group" => Ok(PermissibleKind::Group),
            _ => Err(()),
        }
    }
}

/// Persisted form of a permissible, exchanged with backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissibleRecord {
    pub id: Uuid,
    pub kind: PermissibleKind,
    #[serde(default)]
    pub permissions: Vec<ChildPermission>,
    #[serde(default)]
    pub groups: Vec<GroupMembership>,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub whitelisted: bool,
    #[serde(default)]
    pub op: bool,
    /// Scopes in which this group is the default group
    #[serde(default)]
    pub default_scopes: Vec<References>,
}

impl PermissibleRecord {
    /// Record for an id the store has never seen
    pub fn empty(id: Uuid, kind: PermissibleKind) -> Self {
        Self {
            id,
            kind,
            permissions: Vec::new(),
            groups: Vec::new(),
            banned: false,
            whitelisted: false,
            op: false,
            default_scopes: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct PermissibleState {
    permissions: Vec<ChildPermission>,
    groups: Vec<GroupMembership>,
    debug: bool,
    is_virtual: bool,
    banned: bool,
    whitelisted: bool,
    op: bool,
    default_scopes: Vec<References>,
}

/// Shared base of entities and groups
#[derive(Debug)]
pub struct Permissible {
    id: Uuid,
    kind: PermissibleKind,
    state: RwLock<PermissibleState>,
    dirty: AtomicBool,
}

impl Permissible {
    pub fn new(id: Uuid, kind: PermissibleKind) -> Self {
        Self::from_record(PermissibleRecord::empty(id, kind))
    }

    pub fn from_record(record: PermissibleRecord) -> Self {
        let permissible = Self {
            id: record.id,
            kind: record.kind,
            state: RwLock::new(PermissibleState::default()),
            dirty: AtomicBool::new(false),
        };
        permissible.replace_from(record);
        permissible
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> PermissibleKind {
        self.kind
    }

    pub fn permissions(&self) -> Vec<ChildPermission> {
        self.state.read().permissions.clone()
    }

    pub fn groups(&self) -> Vec<GroupMembership> {
        self.state.read().groups.clone()
    }

    /// Grant a node. An existing grant of the same node under the same
    /// scope is revoked first, grants are never edited in place.
    pub fn add_permission(
        &self,
        namespace: Namespace,
        value: Option<PermissionValue>,
        references: References,
        expiry: Option<DateTime<Utc>>,
    ) -> ChildPermission {
        let grant = ChildPermission::new(self.id, namespace, value, references, expiry);
        let mut state = self.state.write();
        state
            .permissions
            .retain(|p| !p.same_slot(&grant.namespace, &grant.references));
        state.permissions.push(grant.clone());
        self.mark_dirty();
        grant
    }

    /// Revoke a grant, false if there was none
    pub fn remove_permission(&self, namespace: &Namespace, references: &References) -> bool {
        let mut state = self.state.write();
        let before = state.permissions.len();
        state
            .permissions
            .retain(|p| !p.same_slot(namespace, references));
        let removed = state.permissions.len() != before;
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Join a group under a scope. Duplicate `(group, scope)` pairs and
    /// self-membership are rejected.
    pub fn add_group(
        &self,
        group: Uuid,
        references: References,
        expiry: Option<DateTime<Utc>>,
    ) -> bool {
        if group == self.id {
            return false;
        }
        let mut state = self.state.write();
        if state.groups.iter().any(|m| m.same_slot(group, &references)) {
            return false;
        }
        state
            .groups
            .push(GroupMembership::new(group, references, expiry));
        self.mark_dirty();
        true
    }

    pub fn remove_group(&self, group: Uuid, references: &References) -> bool {
        let mut state = self.state.write();
        let before = state.groups.len();
        state.groups.retain(|m| !m.same_slot(group, references));
        let removed = state.groups.len() != before;
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// First live grant of `namespace` whose scope satisfies `scope_matches`
    pub fn find_assignment<F>(
        &self,
        namespace: &Namespace,
        now: DateTime<Utc>,
        scope_matches: F,
    ) -> Option<ChildPermission>
    where
        F: Fn(&References) -> bool,
    {
        self.state
            .read()
            .permissions
            .iter()
            .find(|p| {
                p.namespace == *namespace && !p.is_expired_at(now) && scope_matches(&p.references)
            })
            .cloned()
    }

    /// Live memberships whose scope satisfies `scope_matches`, in insertion order
    pub fn matching_groups<F>(&self, now: DateTime<Utc>, scope_matches: F) -> Vec<Uuid>
    where
        F: Fn(&References) -> bool,
    {
        self.state
            .read()
            .groups
            .iter()
            .filter(|m| !m.is_expired_at(now) && scope_matches(&m.references))
            .map(|m| m.group)
            .collect()
    }

    /// Whether any grant falls under `pattern`
    pub fn holds_under(&self, pattern: &Namespace) -> bool {
        self.state
            .read()
            .permissions
            .iter()
            .any(|p| pattern.matches(&p.namespace))
    }

    /// Drop expired grants and memberships, returning how many went
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let before = state.permissions.len() + state.groups.len();
        state.permissions.retain(|p| !p.is_expired_at(now));
        state.groups.retain(|m| !m.is_expired_at(now));
        let purged = before - (state.permissions.len() + state.groups.len());
        if purged > 0 {
            self.mark_dirty();
        }
        purged
    }

    pub fn is_debug(&self) -> bool {
        self.state.read().debug
    }

    pub fn set_debug(&self, debug: bool) {
        self.state.write().debug = debug;
    }

    /// Virtual permissibles are never written to a backend
    pub fn is_virtual(&self) -> bool {
        self.state.read().is_virtual
    }

    pub fn set_virtual(&self, is_virtual: bool) {
        self.state.write().is_virtual = is_virtual;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn to_record(&self) -> PermissibleRecord {
        let state = self.state.read();
        PermissibleRecord {
            id: self.id,
            kind: self.kind,
            permissions: state.permissions.clone(),
            groups: state.groups.clone(),
            banned: state.banned,
            whitelisted: state.whitelisted,
            op: state.op,
            default_scopes: state.default_scopes.clone(),
        }
    }

    /// Replace all persisted state, keeping identity, debug and virtual flags
    pub(crate) fn replace_from(&self, record: PermissibleRecord) {
        let mut state = self.state.write();
        state.permissions = record.permissions;
        state.groups = record.groups;
        state.banned = record.banned;
        state.whitelisted = record.whitelisted;
        state.op = record.op;
        state.default_scopes = record.default_scopes;
        self.mark_clean();
    }

    pub(crate) fn replace_permissions(&self, permissions: Vec<ChildPermission>) {
        self.state.write().permissions = permissions;
    }

    pub(crate) fn replace_groups(&self, groups: Vec<GroupMembership>) {
        self.state.write().groups = groups;
    }
}

/// A user principal
#[derive(Debug)]
pub struct PermissibleEntity(Permissible);

impl PermissibleEntity {
    pub fn new(id: Uuid) -> Self {
        Self(Permissible::new(id, PermissibleKind::Entity))
    }

    pub fn from_record(mut record: PermissibleRecord) -> Self {
        record.kind = PermissibleKind::Entity;
        Self(Permissible::from_record(record))
    }

    pub fn is_banned(&self) -> bool {
        self.0.state.read().banned
    }

    pub fn set_banned(&self, banned: bool) {
        self.0.state.write().banned = banned;
        self.0.mark_dirty();
    }

    pub fn is_whitelisted(&self) -> bool {
        self.0.state.read().whitelisted
    }

    pub fn set_whitelisted(&self, whitelisted: bool) {
        self.0.state.write().whitelisted = whitelisted;
        self.0.mark_dirty();
    }

    pub fn is_op(&self) -> bool {
        self.0.state.read().op
    }

    pub fn set_op(&self, op: bool) {
        self.0.state.write().op = op;
        self.0.mark_dirty();
    }
}

impl Deref for PermissibleEntity {
    type Target = Permissible;

    fn deref(&self) -> &Permissible {
        &self.0
    }
}

/// A named bundle of assignments other permissibles can join
#[derive(Debug)]
pub struct PermissibleGroup(Permissible);

impl PermissibleGroup {
    pub fn new(id: Uuid) -> Self {
        Self(Permissible::new(id, PermissibleKind::Group))
    }

    pub fn from_record(mut record: PermissibleRecord) -> Self {
        record.kind = PermissibleKind::Group;
        Self(Permissible::from_record(record))
    }

    /// Whether this group is the default group for `references`.
    /// A group that is the global default is the default everywhere.
    pub fn is_default(&self, references: &References) -> bool {
        self.0
            .state
            .read()
            .default_scopes
            .iter()
            .any(|scope| scope.is_global() || scope.same_scope(references))
    }

    pub fn default_scopes(&self) -> Vec<References> {
        self.0.state.read().default_scopes.clone()
    }

    pub(crate) fn add_default_scope(&self, references: References) {
        let mut state = self.0.state.write();
        if !state.default_scopes.iter().any(|s| s.same_scope(&references)) {
            state.default_scopes.push(references);
        }
    }

    pub(crate) fn remove_default_scope(&self, references: &References) {
        self.0
            .state
            .write()
            .default_scopes
            .retain(|s| !s.same_scope(references));
    }
}

impl Deref for PermissibleGroup {
    type Target = Permissible;

    fn deref(&self) -> &Permissible {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ns(s: &str) -> Namespace {
        Namespace::parse(s).unwrap()
    }

    #[test]
    fn test_add_permission_replaces_same_slot() {
        let entity = PermissibleEntity::new(Uuid::new_v4());
        entity.add_permission(
            ns("io.amelia.user"),
            Some(PermissionValue::Bool(true)),
            References::global(),
            None,
        );
        entity.add_permission(
            ns("io.amelia.user"),
            Some(PermissionValue::Bool(false)),
            References::global(),
            None,
        );
        entity.add_permission(
            ns("io.amelia.user"),
            Some(PermissionValue::Bool(true)),
            References::parse("worlda"),
            None,
        );

        let grants = entity.permissions();
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].value, Some(PermissionValue::Bool(false)));
        assert!(entity.is_dirty());
    }

    #[test]
    fn test_remove_permission() {
        let entity = PermissibleEntity::new(Uuid::new_v4());
        entity.add_permission(ns("a.b"), None, References::parse("x"), None);
        assert!(!entity.remove_permission(&ns("a.b"), &References::global()));
        assert!(entity.remove_permission(&ns("a.b"), &References::parse("x")));
        assert!(entity.permissions().is_empty());
    }

    #[test]
    fn test_add_group_rejects_duplicates_and_self() {
        let entity = PermissibleEntity::new(Uuid::new_v4());
        let group = Uuid::new_v4();

        assert!(entity.add_group(group, References::global(), None));
        assert!(!entity.add_group(group, References::global(), None));
        assert!(entity.add_group(group, References::parse("worlda"), None));
        assert!(!entity.add_group(entity.id(), References::global(), None));
        assert_eq!(entity.groups().len(), 2);

        assert!(entity.remove_group(group, &References::parse("worlda")));
        assert_eq!(entity.groups().len(), 1);
    }

    #[test]
    fn test_find_assignment_skips_expired() {
        let entity = PermissibleEntity::new(Uuid::new_v4());
        let now = Utc::now();
        entity.add_permission(
            ns("a.b"),
            Some(PermissionValue::Bool(true)),
            References::global(),
            Some(now - Duration::minutes(1)),
        );
        assert!(entity.find_assignment(&ns("a.b"), now, |_| true).is_none());

        entity.add_permission(
            ns("a.b"),
            Some(PermissionValue::Bool(true)),
            References::parse("w"),
            None,
        );
        assert!(entity.find_assignment(&ns("a.b"), now, |_| true).is_some());
        assert!(entity
            .find_assignment(&ns("a.b"), now, |r| r.is_global())
            .is_none());
    }

    #[test]
    fn test_purge_expired() {
        let entity = PermissibleEntity::new(Uuid::new_v4());
        let now = Utc::now();
        let past = Some(now - Duration::minutes(1));
        entity.add_permission(ns("a.b"), None, References::global(), past);
        entity.add_permission(ns("a.c"), None, References::global(), None);
        entity.add_group(Uuid::new_v4(), References::global(), past);

        assert_eq!(entity.purge_expired(now), 2);
        assert_eq!(entity.permissions().len(), 1);
        assert!(entity.groups().is_empty());
    }

    #[test]
    fn test_record_round_trip_keeps_flags() {
        let entity = PermissibleEntity::new(Uuid::new_v4());
        entity.set_banned(true);
        entity.set_op(true);
        entity.add_group(Uuid::new_v4(), References::parse("w"), None);

        let copy = PermissibleEntity::from_record(entity.to_record());
        assert!(copy.is_banned());
        assert!(copy.is_op());
        assert!(!copy.is_whitelisted());
        assert_eq!(copy.groups(), entity.groups());
        assert!(!copy.is_dirty());
    }

    #[test]
    fn test_group_default_scopes() {
        let group = PermissibleGroup::new(Uuid::new_v4());
        assert!(!group.is_default(&References::global()));

        group.add_default_scope(References::parse("worlda"));
        assert!(group.is_default(&References::parse("worlda")));
        assert!(!group.is_default(&References::parse("worldb")));

        group.add_default_scope(References::global());
        assert!(group.is_default(&References::parse("worldb")));
        assert_eq!(group.default_scopes().len(), 2);
    }
}
