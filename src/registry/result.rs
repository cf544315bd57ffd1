//! Outcome of a permission check

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{Permission, PermissionValue};
use crate::permissible::ChildPermission;
use crate::references::References;

/// Where a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "group")]
pub enum ResultSource {
    /// Assigned to the checked entity itself
    Direct,
    /// Inherited through the given group
    Group(Uuid),
    /// Nothing assigned, the node default applies
    Default,
}

/// Admission state of an entity, independent of any node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissibleState {
    Permitted,
    Banned,
    NotWhitelisted,
}

impl fmt::Display for PermissibleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissibleState::Permitted => write!(f, "permitted"),
            PermissibleState::Banned => write!(f, "banned"),
            PermissibleState::NotWhitelisted => write!(f, "not whitelisted"),
        }
    }
}

/// A resolved permission. Denial is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResult {
    pub holder: Uuid,
    pub permission: Permission,
    pub references: References,
    value: PermissionValue,
    source: ResultSource,
    assignment: Option<ChildPermission>,
    op_override: bool,
}

impl PermissionResult {
    pub(crate) fn new(
        holder: Uuid,
        permission: Permission,
        references: References,
        value: PermissionValue,
        source: ResultSource,
        assignment: Option<ChildPermission>,
    ) -> Self {
        Self {
            holder,
            permission,
            references,
            value,
            source,
            assignment,
            op_override: false,
        }
    }

    pub(crate) fn with_op_override(mut self, op_override: bool) -> Self {
        self.op_override = op_override;
        self
    }

    pub fn value(&self) -> &PermissionValue {
        &self.value
    }

    pub fn source(&self) -> ResultSource {
        self.source
    }

    /// The grant that decided the value, directly or through a group
    pub fn assignment(&self) -> Option<&ChildPermission> {
        self.assignment.as_ref()
    }

    /// Whether a grant (direct or inherited) decided the value
    pub fn is_assigned(&self) -> bool {
        self.assignment.is_some()
    }

    /// True when the value is `Bool(true)` or the ops override applies
    pub fn is_true(&self) -> bool {
        self.op_override || self.value.is_true()
    }

    pub fn is_false(&self) -> bool {
        !self.is_true()
    }

    pub fn is_op_override(&self) -> bool {
        self.op_override
    }

    pub fn as_int(&self) -> Option<i64> {
        self.value.as_int()
    }

    pub fn as_enum(&self) -> Option<&str> {
        match &self.value {
            PermissionValue::Enum(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match &self.value {
            PermissionValue::Unset => "unset".to_string(),
            v => v.to_string(),
        };
        write!(f, "{} = {}", self.permission.namespace, value)?;
        match self.source {
            ResultSource::Direct => write!(f, " (direct)")?,
            ResultSource::Group(group) => write!(f, " (group {})", group)?,
            ResultSource::Default => write!(f, " (default)")?,
        }
        if self.op_override {
            write!(f, " [op]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::node::PermissionTree;

    fn node(default: PermissionValue) -> Permission {
        let mut tree = PermissionTree::new();
        tree.create_node(&Namespace::parse("io.amelia").unwrap(), default)
            .unwrap()
    }

    #[test]
    fn test_unset_default_denies() {
        let result = PermissionResult::new(
            Uuid::new_v4(),
            node(PermissionValue::Unset),
            References::global(),
            PermissionValue::Unset,
            ResultSource::Default,
            None,
        );
        assert!(!result.is_assigned());
        assert!(result.is_false());
        assert_eq!(result.to_string(), "io.amelia = unset (default)");
    }

    #[test]
    fn test_op_override_keeps_value() {
        let result = PermissionResult::new(
            Uuid::new_v4(),
            node(PermissionValue::Bool(false)),
            References::global(),
            PermissionValue::Bool(false),
            ResultSource::Default,
            None,
        )
        .with_op_override(true);
        assert!(result.is_true());
        assert_eq!(result.value(), &PermissionValue::Bool(false));
        assert!(result.to_string().ends_with("[op]"));
    }

    #[test]
    fn test_enum_and_int_accessors() {
        let permission = node(PermissionValue::Unset);
        let result = PermissionResult::new(
            Uuid::new_v4(),
            permission.clone(),
            References::global(),
            PermissionValue::Enum("gold".into()),
            ResultSource::Direct,
            None,
        );
        assert_eq!(result.as_enum(), Some("gold"));
        assert_eq!(result.as_int(), None);
        assert!(!result.is_true());
    }
}
