//! Slash-separated node paths.

use crate::node::InstanceId;
use serde::{Deserialize, Serialize};

/// A segment in a node path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// A named child of a branch
    Key(String),
    /// An instance of a vine
    Instance(InstanceId),
}

impl PathSegment {
    /// Parse one segment. `[n]` denotes a vine instance.
    #[must_use]
    pub fn parse(segment: &str) -> Self {
        segment
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|id| id.parse::<u32>().ok())
            .map_or_else(
                || PathSegment::Key(segment.to_string()),
                |id| PathSegment::Instance(InstanceId(id)),
            )
    }
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{key}"),
            PathSegment::Instance(id) => write!(f, "[{id}]"),
        }
    }
}

/// Full path of a node from its root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodePath {
    /// Segments from the root
    pub segments: Vec<PathSegment>,
}

impl NodePath {
    /// The empty path.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Create a path from segments.
    #[must_use]
    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Append a segment.
    #[must_use]
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }

    /// Parse from `a/b/[3]/c` form. Empty segments are ignored.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(PathSegment::parse)
                .collect(),
        }
    }

    /// Whether this is the empty path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = self
            .segments
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("/");
        write!(f, "{rendered}")
    }
}

impl From<&str> for NodePath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_roundtrip() {
        let path = NodePath::from_segments(vec![
            PathSegment::Key("Public".to_string()),
            PathSegment::Key("Round".to_string()),
        ]);
        assert_eq!(path.to_string(), "Public/Round");
        assert_eq!(NodePath::parse("Public/Round"), path);
    }

    #[test]
    fn path_with_instance() {
        let path = NodePath::root()
            .child(PathSegment::Key("Players".to_string()))
            .child(PathSegment::Instance(InstanceId(3)))
            .child(PathSegment::Key("Health".to_string()));
        assert_eq!(path.to_string(), "Players/[3]/Health");
        assert_eq!(NodePath::parse("Players/[3]/Health"), path);
    }

    #[test]
    fn malformed_instance_is_a_key() {
        assert_eq!(
            PathSegment::parse("[x]"),
            PathSegment::Key("[x]".to_string())
        );
        assert!(NodePath::parse("//").is_root());
    }
}
