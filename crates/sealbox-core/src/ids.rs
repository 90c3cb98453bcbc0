//! Identifiers for principals, resources and document revisions

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Stable user identifier handed out by the identity provider
///
/// Opaque to Sealbox; the identity layer guarantees it never changes for
/// a given principal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user ID from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a protected resource (file, folder, group, conversation)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a resource ID from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random resource ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What kind of thing a resource key protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// File content plus name and size metadata
    File,
    /// Folder name
    Folder,
    /// Group roster and description
    Group,
    /// Chat conversation
    Conversation,
}

impl ResourceKind {
    /// Document collection holding resources of this kind
    pub fn collection(&self) -> &'static str {
        match self {
            ResourceKind::File => "files",
            ResourceKind::Folder => "folders",
            ResourceKind::Group => "groups",
            ResourceKind::Conversation => "conversations",
        }
    }

    /// Whether messages can be posted to this resource
    pub fn is_chat(&self) -> bool {
        matches!(self, ResourceKind::Group | ResourceKind::Conversation)
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::File => write!(f, "file"),
            ResourceKind::Folder => write!(f, "folder"),
            ResourceKind::Group => write!(f, "group"),
            ResourceKind::Conversation => write!(f, "conversation"),
        }
    }
}

/// Document revision, bumped by the store on every successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    /// Revision assigned to a freshly created document
    pub const INITIAL: Revision = Revision(1);

    /// The revision following this one
    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
