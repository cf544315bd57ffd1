//! Arena-backed permission node tree
//!
//! Nodes live in a flat vector; parents own children through index maps and
//! children point back at their parent by index only.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::value::{PermissionType, PermissionValue};
use crate::namespace::{Namespace, NamespaceError};

/// Index of a node inside its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Node {
    local_name: String,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    default_value: PermissionValue,
    value_type: PermissionType,
    description: Option<String>,
    /// Set once a caller created this node explicitly rather than as an ancestor
    declared: bool,
}

/// Owned view of a registered node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    /// `None` for a node that is not in any tree
    pub id: Option<NodeId>,
    pub namespace: Namespace,
    pub default_value: PermissionValue,
    pub value_type: PermissionType,
    pub description: Option<String>,
}

impl Permission {
    /// Stand-in for a node nobody registered: no type, no default
    pub fn unregistered(namespace: Namespace) -> Self {
        Self {
            id: None,
            namespace,
            default_value: PermissionValue::Unset,
            value_type: PermissionType::Unset,
            description: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }

    pub fn local_name(&self) -> &str {
        self.namespace.local_name()
    }
}

/// Forest of permission nodes keyed by local name
#[derive(Debug, Clone, Default)]
pub struct PermissionTree {
    nodes: Vec<Node>,
    roots: HashMap<String, NodeId>,
}

impl PermissionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walk or create every segment of `ns`.
    ///
    /// Existing nodes are reused. The default is applied the first time the
    /// terminal node is explicitly created, so the first write wins even when
    /// the node already existed as an ancestor of another node.
    pub fn create_node(
        &mut self,
        ns: &Namespace,
        default_value: PermissionValue,
    ) -> Result<Permission, NamespaceError> {
        self.walk(ns, Some(default_value))
    }

    /// Walk or create every segment of `ns` without declaring a default.
    /// Used for nodes referenced before anyone registered them.
    pub fn ensure_node(&mut self, ns: &Namespace) -> Result<Permission, NamespaceError> {
        self.walk(ns, None)
    }

    fn walk(
        &mut self,
        ns: &Namespace,
        default_value: Option<PermissionValue>,
    ) -> Result<Permission, NamespaceError> {
        if ns.is_pattern() {
            return Err(NamespaceError::Wildcard(ns.to_string()));
        }

        let segments = ns.segments();
        let mut current: Option<NodeId> = None;
        for (depth, segment) in segments.iter().enumerate() {
            let existing = match current {
                None => self.roots.get(segment).copied(),
                Some(parent) => self.nodes[parent.0].children.get(segment).copied(),
            };

            let terminal = depth == segments.len() - 1;
            let id = match (existing, terminal, &default_value) {
                (Some(id), true, Some(default)) => {
                    let node = &mut self.nodes[id.0];
                    if !node.declared {
                        node.value_type = default.value_type();
                        node.default_value = default.clone();
                        node.declared = true;
                    }
                    id
                }
                (Some(id), _, _) => id,
                (None, true, Some(default)) => {
                    self.insert(segment, current, default.clone(), true)
                }
                (None, _, _) => self.insert(segment, current, PermissionValue::Unset, false),
            };
            current = Some(id);
        }

        // Non-empty namespaces always leave `current` set
        match current {
            Some(id) => Ok(self.snapshot(id)),
            None => Err(NamespaceError::Empty),
        }
    }

    fn insert(
        &mut self,
        name: &str,
        parent: Option<NodeId>,
        default: PermissionValue,
        declared: bool,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            local_name: name.to_string(),
            parent,
            children: BTreeMap::new(),
            value_type: default.value_type(),
            default_value: default,
            description: None,
            declared,
        });
        match parent {
            None => {
                self.roots.insert(name.to_string(), id);
            }
            Some(p) => {
                self.nodes[p.0].children.insert(name.to_string(), id);
            }
        }
        id
    }

    fn find(&self, ns: &Namespace) -> Option<NodeId> {
        let mut segments = ns.segments().iter();
        let mut current = *self.roots.get(segments.next()?)?;
        for segment in segments {
            current = *self.nodes[current.0].children.get(segment)?;
        }
        Some(current)
    }

    /// Exact lookup, `None` when any segment is missing
    pub fn get_node(&self, ns: &Namespace) -> Option<Permission> {
        self.find(ns).map(|id| self.snapshot(id))
    }

    pub fn get_by_id(&self, id: NodeId) -> Option<Permission> {
        (id.0 < self.nodes.len()).then(|| self.snapshot(id))
    }

    /// Every node whose full namespace matches `pattern`, in namespace order
    pub fn get_nodes(&self, pattern: &Namespace) -> Vec<Permission> {
        let mut found: Vec<Permission> = (0..self.nodes.len())
            .map(NodeId)
            .filter(|&id| pattern.matches(&self.namespace_of(id)))
            .map(|id| self.snapshot(id))
            .collect();
        found.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        found
    }

    /// All registered nodes, in namespace order
    pub fn all_nodes(&self) -> Vec<Permission> {
        let mut all: Vec<Permission> = (0..self.nodes.len())
            .map(|i| self.snapshot(NodeId(i)))
            .collect();
        all.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        all
    }

    pub fn children(&self, ns: &Namespace) -> Vec<Permission> {
        let Some(id) = self.find(ns) else {
            return Vec::new();
        };
        self.nodes[id.0]
            .children
            .values()
            .map(|&child| self.snapshot(child))
            .collect()
    }

    /// Set the description of an existing node, false if absent
    pub fn set_description(&mut self, ns: &Namespace, description: impl Into<String>) -> bool {
        match self.find(ns) {
            Some(id) => {
                self.nodes[id.0].description = Some(description.into());
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.roots.clear();
    }

    fn namespace_of(&self, id: NodeId) -> Namespace {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &self.nodes[node_id.0];
            names.push(node.local_name.clone());
            current = node.parent;
        }
        names.reverse();
        Namespace::from_segments(names)
    }

    fn snapshot(&self, id: NodeId) -> Permission {
        let node = &self.nodes[id.0];
        Permission {
            id: Some(id),
            namespace: self.namespace_of(id),
            default_value: node.default_value.clone(),
            value_type: node.value_type,
            description: node.description.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(s: &str) -> Namespace {
        Namespace::parse(s).unwrap()
    }

    #[test]
    fn test_create_walks_intermediate_segments() {
        let mut tree = PermissionTree::new();
        let node = tree
            .create_node(&ns("io.amelia.user"), PermissionValue::Bool(true))
            .unwrap();
        assert_eq!(node.namespace, ns("io.amelia.user"));
        assert_eq!(node.default_value, PermissionValue::Bool(true));
        assert_eq!(node.value_type, PermissionType::Bool);
        assert_eq!(tree.len(), 3);

        let parent = tree.get_node(&ns("io.amelia")).unwrap();
        assert_eq!(parent.default_value, PermissionValue::Unset);
    }

    #[test]
    fn test_create_is_idempotent_first_write_wins() {
        let mut tree = PermissionTree::new();
        let first = tree
            .create_node(&ns("a.b.c"), PermissionValue::Bool(true))
            .unwrap();
        let second = tree
            .create_node(&ns("a.b.c"), PermissionValue::Bool(false))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.default_value, PermissionValue::Bool(true));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_ancestor_accepts_first_explicit_default() {
        let mut tree = PermissionTree::new();
        tree.create_node(&ns("io.amelia.user"), PermissionValue::Bool(false))
            .unwrap();
        let parent = tree
            .create_node(&ns("io.amelia"), PermissionValue::Int(3))
            .unwrap();
        assert_eq!(parent.default_value, PermissionValue::Int(3));
        assert_eq!(parent.value_type, PermissionType::Int);

        let again = tree
            .create_node(&ns("io.amelia"), PermissionValue::Int(9))
            .unwrap();
        assert_eq!(again.default_value, PermissionValue::Int(3));
    }

    #[test]
    fn test_create_rejects_patterns() {
        let mut tree = PermissionTree::new();
        assert!(tree
            .create_node(&ns("io.*"), PermissionValue::Bool(true))
            .is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_get_node_missing_segment() {
        let mut tree = PermissionTree::new();
        tree.create_node(&ns("io.amelia"), PermissionValue::Unset)
            .unwrap();
        assert!(tree.get_node(&ns("io.amelia.user")).is_none());
        assert!(tree.get_node(&ns("other")).is_none());
    }

    #[test]
    fn test_get_nodes_by_prefix_pattern() {
        let mut tree = PermissionTree::new();
        tree.create_node(&ns("io.amelia.user.ban"), PermissionValue::Bool(false))
            .unwrap();
        tree.create_node(&ns("io.amelia.user.kick"), PermissionValue::Bool(false))
            .unwrap();
        tree.create_node(&ns("io.other.user"), PermissionValue::Bool(false))
            .unwrap();

        let found: Vec<String> = tree
            .get_nodes(&ns("io.amelia.*"))
            .iter()
            .map(|p| p.namespace.to_string())
            .collect();
        assert_eq!(
            found,
            vec!["io.amelia.user", "io.amelia.user.ban", "io.amelia.user.kick"]
        );
    }

    #[test]
    fn test_children_and_description() {
        let mut tree = PermissionTree::new();
        tree.create_node(&ns("sys.op"), PermissionValue::Bool(false))
            .unwrap();
        tree.create_node(&ns("sys.admin"), PermissionValue::Bool(false))
            .unwrap();
        assert!(tree.set_description(&ns("sys.op"), "Operator"));
        assert!(!tree.set_description(&ns("sys.none"), "x"));

        let children = tree.children(&ns("sys"));
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].local_name(), "admin");
        assert_eq!(
            tree.get_node(&ns("sys.op")).unwrap().description.as_deref(),
            Some("Operator")
        );
    }

    #[test]
    fn test_ensure_node_leaves_default_open() {
        let mut tree = PermissionTree::new();
        let unknown = tree.ensure_node(&ns("io.amelia.fly")).unwrap();
        assert_eq!(unknown.default_value, PermissionValue::Unset);
        assert_eq!(tree.ensure_node(&ns("io.amelia.fly")).unwrap().id, unknown.id);

        let declared = tree
            .create_node(&ns("io.amelia.fly"), PermissionValue::Bool(true))
            .unwrap();
        assert_eq!(declared.id, unknown.id);
        assert_eq!(declared.default_value, PermissionValue::Bool(true));
    }
}
