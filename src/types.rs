// Validated Types
// Strongly-typed wrappers that enforce invariants at construction time.
// These types cannot be built from invalid data, which removes whole
// classes of bugs from the indexing and query paths.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque node identifier from the snapshot producer.
///
/// # Invariants
/// - Non-empty
/// - No whitespace or control characters
/// - At most 256 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId {
    inner: String,
}

impl NodeId {
    const MAX_LENGTH: usize = 256;

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        ensure!(!id.is_empty(), "Node id cannot be empty");
        ensure!(
            id.len() <= Self::MAX_LENGTH,
            "Node id exceeds maximum length of {} bytes",
            Self::MAX_LENGTH
        );
        ensure!(
            !id.chars().any(|c| c.is_whitespace() || c.is_control()),
            "Node id cannot contain whitespace or control characters"
        );
        Ok(Self { inner: id })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// True when the string is plausibly a node id rather than a display
    /// name. Used by the payload builder to decide reference semantics.
    pub fn looks_like_id(s: &str) -> bool {
        s.len() >= 8
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A workspace alias used to route operations to an isolated store.
///
/// # Invariants
/// - Non-empty
/// - Max 64 characters
/// - Only alphanumeric, dash, underscore
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceAlias {
    inner: String,
}

impl WorkspaceAlias {
    const MAX_LENGTH: usize = 64;

    pub fn new(alias: impl Into<String>) -> Result<Self> {
        let alias = alias.into();
        ensure!(!alias.is_empty(), "Workspace alias cannot be empty");
        ensure!(
            alias.len() <= Self::MAX_LENGTH,
            "Workspace alias exceeds maximum length of {} characters",
            Self::MAX_LENGTH
        );
        ensure!(
            alias
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "Workspace alias may only contain alphanumerics, dash and underscore"
        );
        Ok(Self { inner: alias })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for WorkspaceAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Lowercased, non-alphanumeric-stripped form used for name lookups.
///
/// Normalization is total: every input maps to some (possibly empty)
/// normalized form, so this type has no failing constructor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedName {
    inner: String,
}

impl NormalizedName {
    pub fn of(name: &str) -> Self {
        Self {
            inner: name
                .chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(|c| c.to_lowercase())
                .collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Display for NormalizedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A result-set limit with the documented default and hard cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidatedLimit {
    inner: usize,
}

impl ValidatedLimit {
    pub const DEFAULT: usize = 100;
    pub const MAX: usize = 1000;

    /// Create a limit; out-of-range values are errors so callers surface
    /// them instead of silently shrinking result sets.
    pub fn new(limit: usize) -> Result<Self> {
        ensure!(limit > 0, "Limit must be greater than zero");
        ensure!(limit <= Self::MAX, "Limit exceeds maximum of {}", Self::MAX);
        Ok(Self { inner: limit })
    }

    /// Clamp an arbitrary requested limit into the valid range.
    pub fn clamped(limit: usize) -> Self {
        Self {
            inner: limit.clamp(1, Self::MAX),
        }
    }

    pub fn get(&self) -> usize {
        self.inner
    }
}

impl Default for ValidatedLimit {
    fn default() -> Self {
        Self {
            inner: Self::DEFAULT,
        }
    }
}

/// Inferred data type of a supertag field.
///
/// Closed set; adding a member is a code change accompanied by a
/// forward-only store migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldDataType {
    Text,
    Date,
    Reference,
    Url,
    Number,
    Checkbox,
    Email,
    Phone,
}

impl FieldDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldDataType::Text => "text",
            FieldDataType::Date => "date",
            FieldDataType::Reference => "reference",
            FieldDataType::Url => "url",
            FieldDataType::Number => "number",
            FieldDataType::Checkbox => "checkbox",
            FieldDataType::Email => "email",
            FieldDataType::Phone => "phone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(FieldDataType::Text),
            "date" => Some(FieldDataType::Date),
            "reference" => Some(FieldDataType::Reference),
            "url" => Some(FieldDataType::Url),
            "number" => Some(FieldDataType::Number),
            "checkbox" => Some(FieldDataType::Checkbox),
            "email" => Some(FieldDataType::Email),
            "phone" => Some(FieldDataType::Phone),
            _ => None,
        }
    }
}

impl fmt::Display for FieldDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source document type discriminator (`props._docType`).
///
/// Indexed semantics only care about a fixed closed set; everything else
/// is carried through as `Other` with the original tag preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocType {
    Tuple,
    TagDef,
    AttrDef,
    Metanode,
    ViewDef,
    Search,
    Command,
    Hotkey,
    AssociatedData,
    Visual,
    JournalPart,
    Group,
    Chatbot,
    Workspace,
    Other(String),
}

impl DocType {
    pub fn parse(s: &str) -> Self {
        match s {
            "tuple" => DocType::Tuple,
            "tagDef" => DocType::TagDef,
            "attrDef" => DocType::AttrDef,
            "metanode" => DocType::Metanode,
            "viewDef" => DocType::ViewDef,
            "search" => DocType::Search,
            "command" => DocType::Command,
            "hotkey" => DocType::Hotkey,
            "associatedData" => DocType::AssociatedData,
            "visual" => DocType::Visual,
            "journalPart" => DocType::JournalPart,
            "group" => DocType::Group,
            "chatbot" => DocType::Chatbot,
            "workspace" => DocType::Workspace,
            other => DocType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DocType::Tuple => "tuple",
            DocType::TagDef => "tagDef",
            DocType::AttrDef => "attrDef",
            DocType::Metanode => "metanode",
            DocType::ViewDef => "viewDef",
            DocType::Search => "search",
            DocType::Command => "command",
            DocType::Hotkey => "hotkey",
            DocType::AssociatedData => "associatedData",
            DocType::Visual => "visual",
            DocType::JournalPart => "journalPart",
            DocType::Group => "group",
            DocType::Chatbot => "chatbot",
            DocType::Workspace => "workspace",
            DocType::Other(s) => s.as_str(),
        }
    }

    /// System doc types carry structural bookkeeping, not user content.
    /// They are excluded from embedding selection.
    pub fn is_system(&self) -> bool {
        !matches!(self, DocType::Other(_))
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_rejects_empty_and_whitespace() {
        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("has space").is_err());
        assert!(NodeId::new("line\nbreak").is_err());
        assert!(NodeId::new("z8k2mD_4x-1").is_ok());
    }

    #[test]
    fn node_id_heuristic() {
        assert!(NodeId::looks_like_id("aB3dE5g7"));
        assert!(NodeId::looks_like_id("z8k2mD_4x-1"));
        assert!(!NodeId::looks_like_id("short"));
        assert!(!NodeId::looks_like_id("has space in it"));
    }

    #[test]
    fn normalized_name_strips_and_lowercases() {
        assert_eq!(NormalizedName::of("Due Date").as_str(), "duedate");
        assert_eq!(NormalizedName::of("E-Mail (work)").as_str(), "emailwork");
        assert_eq!(NormalizedName::of("  ").as_str(), "");
    }

    #[test]
    fn limit_defaults_and_caps() {
        assert_eq!(ValidatedLimit::default().get(), 100);
        assert!(ValidatedLimit::new(0).is_err());
        assert!(ValidatedLimit::new(1001).is_err());
        assert_eq!(ValidatedLimit::clamped(5000).get(), 1000);
        assert_eq!(ValidatedLimit::clamped(0).get(), 1);
    }

    #[test]
    fn doc_type_round_trips_known_and_unknown() {
        assert_eq!(DocType::parse("tagDef"), DocType::TagDef);
        assert_eq!(DocType::parse("tuple").as_str(), "tuple");
        let other = DocType::parse("somethingNew");
        assert_eq!(other.as_str(), "somethingNew");
        assert!(!other.is_system());
        assert!(DocType::Metanode.is_system());
    }

    #[test]
    fn workspace_alias_charset() {
        assert!(WorkspaceAlias::new("main").is_ok());
        assert!(WorkspaceAlias::new("team-kb_2").is_ok());
        assert!(WorkspaceAlias::new("bad alias").is_err());
        assert!(WorkspaceAlias::new("").is_err());
    }
}
