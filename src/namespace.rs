//! Permission namespace parsing and matching
//!
//! Namespaces are dotted paths naming permission nodes:
//! - Segments separated by `.`
//! - Each segment: `[a-z0-9_]+`, or a pattern containing `*`
//! - A lone `*` matches exactly one opposing segment
//! - A terminal `*` matches one or more remaining segments
//! - Normalized to lowercase

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wildcard marker
pub const WILDCARD: &str = "*";

/// Validation errors for namespaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceError {
    /// Namespace is empty
    Empty,
    /// Namespace contains an empty segment (consecutive, leading or trailing dots)
    EmptySegment(String),
    /// Segment contains characters outside `[a-z0-9_*]`
    InvalidSegment(String),
    /// A concrete namespace was required but a pattern was given
    Wildcard(String),
}

impl fmt::Display for NamespaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceError::Empty => write!(f, "Namespace cannot be empty"),
            NamespaceError::EmptySegment(ns) => {
                write!(f, "Namespace '{}' contains an empty segment", ns)
            }
            NamespaceError::InvalidSegment(seg) => {
                write!(
                    f,
                    "Segment '{}' contains invalid characters (allowed: lowercase letters, digits, underscores, '*')",
                    seg
                )
            }
            NamespaceError::Wildcard(ns) => {
                write!(f, "Namespace '{}' must not contain wildcards", ns)
            }
        }
    }
}

impl std::error::Error for NamespaceError {}

static SEGMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9_*]+$").unwrap());

/// Immutable dotted permission path, e.g. `io.amelia.user.ban`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    segments: Vec<String>,
}

impl Namespace {
    /// Parse and normalize a namespace string.
    ///
    /// # Examples
    /// ```
    /// use permtree::Namespace;
    ///
    /// assert!(Namespace::parse("io.amelia.user.ban").is_ok());
    /// assert!(Namespace::parse("io.amelia.*").is_ok());
    /// assert!(Namespace::parse("IO.Amelia").is_ok()); // Normalized to "io.amelia"
    ///
    /// assert!(Namespace::parse("io..amelia").is_err()); // Empty segment
    /// assert!(Namespace::parse("io.ame-lia").is_err()); // Hyphen not allowed
    /// ```
    pub fn parse(s: &str) -> Result<Self, NamespaceError> {
        let normalized = s.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(NamespaceError::Empty);
        }

        let mut segments = Vec::new();
        for segment in normalized.split('.') {
            if segment.is_empty() {
                return Err(NamespaceError::EmptySegment(normalized.clone()));
            }
            if !SEGMENT_REGEX.is_match(segment) {
                return Err(NamespaceError::InvalidSegment(segment.to_string()));
            }
            segments.push(segment.to_string());
        }

        Ok(Self { segments })
    }

    /// Segments already validated elsewhere, e.g. by the node tree
    pub(crate) fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Parse a namespace that must name a concrete node (no wildcards)
    pub fn parse_concrete(s: &str) -> Result<Self, NamespaceError> {
        let ns = Self::parse(s)?;
        if ns.is_pattern() {
            return Err(NamespaceError::Wildcard(ns.to_string()));
        }
        Ok(ns)
    }

    /// Parse the slash-joined form used as a single storage key
    pub fn from_key(key: &str) -> Result<Self, NamespaceError> {
        Self::parse(&key.replace('/', "."))
    }

    /// Slash-joined form, usable as a single key in dotted-key stores
    pub fn to_key(&self) -> String {
        self.segments.join("/")
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment
    pub fn local_name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    /// Namespace without its first segment, `None` for a single segment
    pub fn drop_first(&self) -> Option<Namespace> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[1..].to_vec(),
        })
    }

    /// Namespace without its last segment, `None` for a single segment
    pub fn parent(&self) -> Option<Namespace> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Append one segment
    pub fn join(&self, segment: &str) -> Result<Namespace, NamespaceError> {
        Self::parse(&format!("{}.{}", self, segment))
    }

    /// Whether any segment contains a wildcard
    pub fn is_pattern(&self) -> bool {
        self.segments.iter().any(|s| s.contains('*'))
    }

    /// True iff `prefix` is a literal leading subsequence of this namespace.
    pub fn starts_with(&self, prefix: &Namespace) -> bool {
        if prefix.is_pattern() || prefix.len() > self.len() {
            return false;
        }
        self.segments.iter().zip(&prefix.segments).all(|(a, b)| a == b)
    }

    /// Segment-wise match where either side may carry wildcards.
    ///
    /// A terminal `*` swallows one or more remaining segments, so
    /// `io.amelia.*` matches `io.amelia.user.ban` but not `io.amelia`.
    pub fn matches(&self, other: &Namespace) -> bool {
        let (a, b) = (&self.segments, &other.segments);
        let mut i = 0;
        loop {
            match (a.get(i), b.get(i)) {
                (None, None) => return true,
                (Some(x), Some(y)) => {
                    if x == WILDCARD && i == a.len() - 1 {
                        return true;
                    }
                    if y == WILDCARD && i == b.len() - 1 {
                        return true;
                    }
                    if !segment_matches(x, y) {
                        return false;
                    }
                }
                _ => return false,
            }
            i += 1;
        }
    }
}

fn segment_matches(a: &str, b: &str) -> bool {
    if a == b || a == WILDCARD || b == WILDCARD {
        return true;
    }
    if a.contains('*') && glob_matches(a, b) {
        return true;
    }
    b.contains('*') && glob_matches(b, a)
}

fn glob_matches(pattern: &str, segment: &str) -> bool {
    let escaped = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[a-z0-9_*]*");
    Regex::new(&format!("^{}$", escaped))
        .map(|re| re.is_match(segment))
        .unwrap_or(false)
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for Namespace {
    type Err = NamespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Namespace::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(s: &str) -> Namespace {
        Namespace::parse(s).unwrap()
    }

    #[test]
    fn test_valid_namespaces() {
        assert_eq!(ns("io").to_string(), "io");
        assert_eq!(ns("io.amelia.user.ban").to_string(), "io.amelia.user.ban");
        assert_eq!(ns("sys.op_level2").to_string(), "sys.op_level2");
        assert_eq!(ns("IO.Amelia").to_string(), "io.amelia");
        assert_eq!(ns("io.amelia.*").len(), 3);
    }

    #[test]
    fn test_invalid_namespaces() {
        assert_eq!(Namespace::parse(""), Err(NamespaceError::Empty));
        assert!(matches!(
            Namespace::parse("io..amelia"),
            Err(NamespaceError::EmptySegment(_))
        ));
        assert!(matches!(
            Namespace::parse("io.amelia."),
            Err(NamespaceError::EmptySegment(_))
        ));
        assert_eq!(
            Namespace::parse("io.ame-lia"),
            Err(NamespaceError::InvalidSegment("ame-lia".to_string()))
        );
        assert!(Namespace::parse("io amelia").is_err());
        assert!(matches!(
            Namespace::parse_concrete("io.*"),
            Err(NamespaceError::Wildcard(_))
        ));
    }

    #[test]
    fn test_terminal_wildcard_spans_segments() {
        let pattern = ns("io.amelia.*");
        assert!(pattern.matches(&ns("io.amelia.user")));
        assert!(pattern.matches(&ns("io.amelia.user.ban")));
        assert!(ns("io.amelia.user.ban").matches(&pattern));
        assert!(!pattern.matches(&ns("io.amelia")));
        assert!(!pattern.matches(&ns("io.other.user")));
    }

    #[test]
    fn test_inner_wildcard_single_segment() {
        let pattern = ns("io.*.ban");
        assert!(pattern.matches(&ns("io.amelia.ban")));
        assert!(!pattern.matches(&ns("io.amelia.user.ban")));
    }

    #[test]
    fn test_glob_segment() {
        let pattern = ns("io.amelia.us*r");
        assert!(pattern.matches(&ns("io.amelia.user")));
        assert!(pattern.matches(&ns("io.amelia.usr")));
        assert!(!pattern.matches(&ns("io.amelia.group")));
    }

    #[test]
    fn test_literal_mismatch() {
        assert!(!ns("io.amelia.user").matches(&ns("io.other.user")));
        assert!(!ns("io.amelia").matches(&ns("io.amelia.user")));
        assert!(ns("io.amelia.user").matches(&ns("io.amelia.user")));
    }

    #[test]
    fn test_starts_with() {
        let full = ns("io.amelia.user.ban");
        assert!(full.starts_with(&ns("io.amelia")));
        assert!(full.starts_with(&ns("io.amelia.user.ban")));
        assert!(!full.starts_with(&ns("io.other")));
        assert!(!full.starts_with(&ns("io.*")));
    }

    #[test]
    fn test_structure_helpers() {
        let full = ns("io.amelia.user");
        assert_eq!(full.drop_first(), Some(ns("amelia.user")));
        assert_eq!(full.parent(), Some(ns("io.amelia")));
        assert_eq!(full.local_name(), "user");
        assert_eq!(ns("io").drop_first(), None);
        assert_eq!(full.join("ban").unwrap(), ns("io.amelia.user.ban"));
        assert_eq!(full.to_key(), "io/amelia/user");
        assert_eq!(Namespace::from_key("io/amelia/user").unwrap(), full);
    }

    #[test]
    fn test_ordering() {
        let mut list = vec![ns("io.b"), ns("io.a.z"), ns("io.a")];
        list.sort();
        assert_eq!(list, vec![ns("io.a"), ns("io.a.z"), ns("io.b")]);
    }
}
