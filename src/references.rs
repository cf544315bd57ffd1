//! Reference scopes and reference inheritance
//!
//! A `References` value is the set of context tokens an assignment or a check
//! applies to. The empty set is the global scope. Inheritance declares that a
//! query in one token may also see assignments made in others:
//! `worldb -> {worlda}` lets a `worldb` check see `worlda` grants, not the
//! reverse.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered, de-duplicated set of scope tokens
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct References {
    tokens: Vec<String>,
}

impl References {
    /// The unscoped context
    pub fn global() -> Self {
        Self::default()
    }

    /// Build from tokens, normalizing case and dropping blanks and repeats
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut refs = Self::default();
        for token in tokens {
            refs.add(token.as_ref());
        }
        refs
    }

    /// Parse the comma-joined storage form
    pub fn parse(s: &str) -> Self {
        Self::new(s.split(','))
    }

    /// Add a token, returns false if it was blank or already present
    pub fn add(&mut self, token: &str) -> bool {
        let token = token.trim().to_lowercase();
        if token.is_empty() || self.tokens.contains(&token) {
            return false;
        }
        self.tokens.push(token);
        true
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    /// True for the global scope
    pub fn is_global(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn intersects(&self, other: &References) -> bool {
        self.tokens.iter().any(|t| other.contains(t))
    }

    /// Set equality, ignoring token order
    pub fn same_scope(&self, other: &References) -> bool {
        self.tokens.len() == other.tokens.len() && self.tokens.iter().all(|t| other.contains(t))
    }

    /// Sorted copy, usable as a map key where token order must not matter
    pub fn canonical(&self) -> References {
        let mut tokens = self.tokens.clone();
        tokens.sort();
        Self { tokens }
    }
}

impl fmt::Display for References {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens.join(","))
    }
}

impl From<&str> for References {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<&[&str]> for References {
    fn from(tokens: &[&str]) -> Self {
        Self::new(tokens.iter())
    }
}

impl Serialize for References {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for References {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Process-wide `token -> implied tokens` table.
///
/// Writes copy the table and swap the snapshot; readers never block on a
/// writer for longer than an `Arc` clone.
#[derive(Debug, Default)]
pub struct RefInheritance {
    table: RwLock<Arc<HashMap<String, BTreeSet<String>>>>,
}

impl RefInheritance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `token` also sees assignments scoped to `implied`.
    /// The table only grows.
    pub fn set_ref_inheritance<I, S>(&self, token: &str, implied: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let key = token.trim().to_lowercase();
        let implied: Vec<String> = implied
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty() && *t != key)
            .collect();
        if key.is_empty() || implied.is_empty() {
            return;
        }

        let mut guard = self.table.write();
        let mut next = HashMap::clone(&guard);
        next.entry(key).or_default().extend(implied);
        *guard = Arc::new(next);
    }

    /// Current snapshot of the table
    pub fn snapshot(&self) -> Arc<HashMap<String, BTreeSet<String>>> {
        self.table.read().clone()
    }

    /// Query tokens plus everything they transitively imply.
    /// Cyclic declarations terminate through the visited set.
    pub fn expand(&self, query: &References) -> References {
        let table = self.snapshot();
        let mut visited: HashSet<String> = HashSet::new();
        let mut expanded = References::global();
        let mut stack: Vec<String> = query.tokens().iter().rev().cloned().collect();

        while let Some(token) = stack.pop() {
            if !visited.insert(token.clone()) {
                continue;
            }
            expanded.add(&token);
            if let Some(implied) = table.get(&token) {
                stack.extend(implied.iter().rev().cloned());
            }
        }
        expanded
    }

    /// Whether an assignment scoped to `assignment` is visible to a check
    /// scoped to `query`.
    pub fn matches(&self, assignment: &References, query: &References) -> bool {
        assignment.is_global() || assignment.intersects(&self.expand(query))
    }

    pub fn clear(&self) {
        *self.table.write() = Arc::new(HashMap::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        let refs = References::parse(" WorldA, worldb,,worlda ");
        assert_eq!(refs.tokens(), &["worlda".to_string(), "worldb".to_string()]);
        assert_eq!(refs.to_string(), "worlda,worldb");
        assert!(References::parse("").is_global());
        assert!(References::new([""]).is_global());
    }

    #[test]
    fn test_same_scope_ignores_order() {
        let a = References::parse("a,b");
        let b = References::parse("b,a");
        assert!(a.same_scope(&b));
        assert!(!a.same_scope(&References::parse("a")));
    }

    #[test]
    fn test_global_assignment_matches_everything() {
        let inheritance = RefInheritance::new();
        assert!(inheritance.matches(&References::global(), &References::parse("worlda")));
        assert!(inheritance.matches(&References::global(), &References::global()));
    }

    #[test]
    fn test_scoped_assignment_needs_intersection() {
        let inheritance = RefInheritance::new();
        let assignment = References::parse("worlda");
        assert!(inheritance.matches(&assignment, &References::parse("worlda,worldc")));
        assert!(!inheritance.matches(&assignment, &References::parse("worldb")));
        assert!(!inheritance.matches(&assignment, &References::global()));
    }

    #[test]
    fn test_inheritance_is_one_directional() {
        let inheritance = RefInheritance::new();
        inheritance.set_ref_inheritance("worldb", ["worlda"]);

        assert!(inheritance.matches(&References::parse("worlda"), &References::parse("worldb")));
        assert!(!inheritance.matches(&References::parse("worldb"), &References::parse("worlda")));
    }

    #[test]
    fn test_inheritance_is_transitive() {
        let inheritance = RefInheritance::new();
        inheritance.set_ref_inheritance("c", ["b"]);
        inheritance.set_ref_inheritance("b", ["a"]);

        let expanded = inheritance.expand(&References::parse("c"));
        assert!(expanded.contains("a"));
        assert!(expanded.contains("b"));
        assert!(expanded.contains("c"));
    }

    #[test]
    fn test_cyclic_inheritance_terminates() {
        let inheritance = RefInheritance::new();
        inheritance.set_ref_inheritance("a", ["b"]);
        inheritance.set_ref_inheritance("b", ["c"]);
        inheritance.set_ref_inheritance("c", ["a"]);

        let expanded = inheritance.expand(&References::parse("a"));
        assert_eq!(expanded.tokens().len(), 3);
    }

    #[test]
    fn test_inheritance_grows_monotonically() {
        let inheritance = RefInheritance::new();
        inheritance.set_ref_inheritance("a", ["b"]);
        inheritance.set_ref_inheritance("a", ["c"]);
        let table = inheritance.snapshot();
        assert_eq!(table["a"].len(), 2);
    }
}
