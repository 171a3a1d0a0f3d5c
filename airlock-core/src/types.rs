//! Identifier newtypes and small value types shared across the service.
//!
//! Newtypes keep the many stringly-typed identifiers (request ids, workspace
//! names, relative paths, content hashes) from being mixed up at call sites.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AirlockError;

/// Opaque stable identifier for a release request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier for a file-group comment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub String);

impl CommentId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A sha256 content hash, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContentHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A path relative to a workspace root.
///
/// Validated at construction: relative, normal components only. This is the
/// only place traversal checking happens, so everything downstream can join
/// a `RelPath` onto a root directory without re-validating.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelPath(String);

impl RelPath {
    pub fn new(path: impl Into<String>) -> Result<Self, AirlockError> {
        let path = path.into();
        if path.is_empty() {
            return Err(AirlockError::Precondition("empty file path".to_string()));
        }
        let p = Path::new(&path);
        let all_normal = p.components().all(|c| matches!(c, Component::Normal(_)));
        if !all_normal || path.contains('\\') {
            return Err(AirlockError::Precondition(format!(
                "invalid file path: {path}"
            )));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join onto a root directory. Safe by construction.
    pub fn under(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }

    /// The file extension, if any.
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.0).extension().and_then(|e| e.to_str())
    }

    /// Whether this file type is allowed onto a release request. Everything
    /// else (pickles, binaries, notebooks) must be converted by the
    /// researcher before release.
    pub fn has_releasable_extension(&self) -> bool {
        self.extension()
            .map(|ext| {
                RELEASABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
            })
            .unwrap_or(false)
    }
}

const RELEASABLE_EXTENSIONS: &[&str] = &[
    "csv", "tsv", "txt", "log", "html", "htm", "json", "md", "png", "jpg", "jpeg", "svg",
];

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a request file is intended for release or is context-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Output,
    Supporting,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Supporting => "supporting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "output" => Some(Self::Output),
            "supporting" => Some(Self::Supporting),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Size, mtime and content hash for a workspace file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    /// Unix timestamp of last modification.
    pub timestamp: i64,
    pub content_hash: ContentHash,
}

/// Status of a workspace path relative to the viewer's current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceFileStatus {
    /// Same content released by a previous request.
    Released,
    /// On the current request with a different hash than the workspace copy.
    Updated,
    /// On the current request with a matching hash.
    UnderReview,
    /// Tombstoned on the current request.
    Withdrawn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relpath_accepts_nested() {
        let p = RelPath::new("output/results/table.csv").unwrap();
        assert_eq!(p.as_str(), "output/results/table.csv");
        assert_eq!(p.extension(), Some("csv"));
    }

    #[test]
    fn test_relpath_rejects_traversal() {
        assert!(RelPath::new("../etc/passwd").is_err());
        assert!(RelPath::new("output/../../etc/passwd").is_err());
        assert!(RelPath::new("/absolute/path").is_err());
        assert!(RelPath::new("").is_err());
        assert!(RelPath::new("windows\\style").is_err());
    }

    #[test]
    fn test_relpath_under_root() {
        let p = RelPath::new("output/a.csv").unwrap();
        let joined = p.under(Path::new("/work/ws1"));
        assert_eq!(joined, PathBuf::from("/work/ws1/output/a.csv"));
    }

    #[test]
    fn test_releasable_extensions() {
        assert!(RelPath::new("output/a.csv").unwrap().has_releasable_extension());
        assert!(RelPath::new("output/A.CSV").unwrap().has_releasable_extension());
        assert!(RelPath::new("plot.png").unwrap().has_releasable_extension());
        assert!(!RelPath::new("model.pickle").unwrap().has_releasable_extension());
        assert!(!RelPath::new("no_extension").unwrap().has_releasable_extension());
    }

    #[test]
    fn test_filetype_round_trip() {
        assert_eq!(FileType::parse("output"), Some(FileType::Output));
        assert_eq!(FileType::parse("supporting"), Some(FileType::Supporting));
        assert_eq!(FileType::parse("code"), None);
        assert_eq!(FileType::Output.as_str(), "output");
    }

    #[test]
    fn test_request_id_generate_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }
}
