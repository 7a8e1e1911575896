//! Property path parsing.
//!
//! Every property lives under a tree-specific root prefix: `@/` for the main
//! tree and `@/metrics/` for the metrics side tree. A trailing slash on a
//! lookup path means "this must resolve to an internal node"; empty segments
//! are collapsed.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("property path '{0}' does not start with '{1}/'")]
    BadPrefix(String, String),

    #[error("property path '{0}' contains an illegal segment")]
    BadSegment(String),
}

/// A parsed property path: the segments below the tree root, plus whether
/// the original string carried a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropPath {
    segments: Vec<String>,
    dir: bool,
}

impl PropPath {
    /// Parses `source` against the given root prefix (e.g. `@` or
    /// `@/metrics`). The root itself (`@/` or `@`) parses to an empty
    /// segment list.
    pub fn parse(root: &str, source: &str) -> Result<PropPath, PathError> {
        let rest = if source == root {
            ""
        } else {
            match source.strip_prefix(root) {
                Some(rest) if rest.starts_with('/') => &rest[1..],
                _ => return Err(PathError::BadPrefix(source.to_owned(), root.to_owned())),
            }
        };

        let dir = rest.is_empty() || rest.ends_with('/');

        let mut segments = Vec::new();
        for segment in rest.split('/') {
            // Collapse empty segments, including the one a trailing slash
            // produces.
            if segment.is_empty() {
                continue;
            }
            if segment.contains(char::is_whitespace) {
                return Err(PathError::BadSegment(source.to_owned()));
            }
            segments.push(segment.to_owned());
        }

        Ok(PropPath { segments, dir })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True when the source path ended in a slash, constraining lookups to
    /// internal nodes.
    pub fn is_dir(&self) -> bool {
        self.dir
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The final segment, or None for the root.
    pub fn leaf_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Extends the path by one segment.
    pub fn child(&self, name: &str) -> PropPath {
        let mut segments = self.segments.clone();
        segments.push(name.to_owned());
        PropPath {
            segments,
            dir: false,
        }
    }

    /// Rebuilds the canonical string form under `root`.
    pub fn to_string_under(&self, root: &str) -> String {
        if self.segments.is_empty() {
            return format!("{root}/");
        }
        let mut out = String::from(root);
        for segment in &self.segments {
            out.push('/');
            out.push_str(segment);
        }
        out
    }
}

impl fmt::Display for PropPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_under(crate::tree::MAIN_ROOT))
    }
}
