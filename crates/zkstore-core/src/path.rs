//! Mapping between object keys and znode paths.
//!
//! Object keys are slash-delimited strings relative to the store root. Every
//! key maps onto exactly one znode below the configured root prefix, and
//! every znode below the prefix maps back onto exactly one key.

use std::fmt;

use crate::error::{Result, StoreError};

/// Separator shared by object keys and znode paths.
pub const SEPARATOR: char = '/';

/// Default upper bound on the byte length of a znode path.
pub const DEFAULT_MAX_PATH_LEN: usize = 1024;

/// Subtree the ensemble reserves for itself.
const RESERVED_ROOT: &str = "/zookeeper";

fn invalid(path: &str, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidPath {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// ZooKeeper refuses NUL and a few control, private-use and special ranges.
fn is_reserved_char(c: char) -> bool {
    matches!(c,
        '\u{0000}'..='\u{001f}'
        | '\u{007f}'..='\u{009f}'
        | '\u{e000}'..='\u{f8ff}'
        | '\u{fff0}'..='\u{ffff}')
}

fn validate_segment(original: &str, segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(invalid(original, "empty path segment"));
    }
    if segment == "." || segment == ".." {
        return Err(invalid(original, format!("relative segment '{}'", segment)));
    }
    if let Some(c) = segment.chars().find(|c| is_reserved_char(*c)) {
        return Err(invalid(
            original,
            format!("reserved character U+{:04X}", c as u32),
        ));
    }
    Ok(())
}

/// A normalized object key: a sequence of non-empty segments.
///
/// The empty sequence is the root of the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectPath {
    segments: Vec<String>,
}

impl ObjectPath {
    /// The root of the store.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses and normalizes a key.
    ///
    /// Leading and trailing separators are ignored, so `"a/b"`, `"/a/b"` and
    /// the directory-style `"a/b/"` all name the same path.
    pub fn parse(key: &str) -> Result<Self> {
        let trimmed = key.trim_matches(SEPARATOR);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split(SEPARATOR) {
            validate_segment(key, segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Builds a path from pre-split segments.
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        let joined = segments.join("/");
        for segment in &segments {
            if segment.contains(SEPARATOR) {
                return Err(invalid(&joined, "segment contains separator"));
            }
            validate_segment(&joined, segment)?;
        }
        Ok(Self { segments })
    }

    /// Returns true for the store root.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The path segments in order.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The last segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The enclosing directory, or `None` for the root.
    pub fn parent(&self) -> Option<ObjectPath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Appends one segment.
    pub fn child(&self, name: &str) -> Result<ObjectPath> {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self::from_segments(segments)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

/// An absolute znode path, always starting with `/` and never ending with
/// one unless it is `/` itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZnodePath(String);

impl ZnodePath {
    /// The ensemble root `/`.
    pub fn ensemble_root() -> Self {
        Self("/".to_string())
    }

    /// The path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for `/`.
    pub fn is_ensemble_root(&self) -> bool {
        self.0 == "/"
    }

    /// Appends a child name.
    pub fn join(&self, name: &str) -> ZnodePath {
        if self.is_ensemble_root() {
            ZnodePath(format!("/{}", name))
        } else {
            ZnodePath(format!("{}/{}", self.0, name))
        }
    }

    /// Every proper prefix from the first component down, excluding `/` and
    /// the path itself: `/a/b/c` yields `/a`, `/a/b`.
    pub fn ancestors(&self) -> Vec<ZnodePath> {
        let mut out = Vec::new();
        for (idx, c) in self.0.char_indices().skip(1) {
            if c == SEPARATOR {
                out.push(ZnodePath(self.0[..idx].to_string()));
            }
        }
        out
    }
}

impl fmt::Display for ZnodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ZnodePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Translates object keys to znode paths under a root prefix.
#[derive(Debug, Clone)]
pub struct PathMapper {
    root: ZnodePath,
    max_path_len: usize,
}

impl PathMapper {
    /// Creates a mapper rooted at `root` (for example `/` or `/zkstore/data`).
    pub fn new(root: &str, max_path_len: usize) -> Result<Self> {
        let prefix = ObjectPath::parse(root)?;
        let root = if prefix.is_root() {
            ZnodePath::ensemble_root()
        } else {
            ZnodePath(format!("/{}", prefix.segments().join("/")))
        };
        if root.as_str().len() > max_path_len {
            return Err(invalid(
                root.as_str(),
                format!("root exceeds {} bytes", max_path_len),
            ));
        }
        if is_reserved_subtree(root.as_str()) {
            return Err(invalid(root.as_str(), "reserved by the ensemble"));
        }
        Ok(Self { root, max_path_len })
    }

    /// The znode backing the store root.
    pub fn root(&self) -> &ZnodePath {
        &self.root
    }

    /// The root znode and its ancestors, outermost first. These must exist
    /// before any operation runs.
    pub fn root_chain(&self) -> Vec<ZnodePath> {
        if self.root.is_ensemble_root() {
            return Vec::new();
        }
        let mut chain = self.root.ancestors();
        chain.push(self.root.clone());
        chain
    }

    /// Maps an object path onto its znode.
    pub fn to_znode(&self, path: &ObjectPath) -> Result<ZnodePath> {
        let mut znode = self.root.clone();
        for segment in path.segments() {
            znode = znode.join(segment);
        }
        if znode.as_str().len() > self.max_path_len {
            return Err(invalid(
                &path.to_string(),
                format!(
                    "znode path is {} bytes, limit is {}",
                    znode.as_str().len(),
                    self.max_path_len
                ),
            ));
        }
        if is_reserved_subtree(znode.as_str()) {
            return Err(invalid(&path.to_string(), "reserved by the ensemble"));
        }
        Ok(znode)
    }

    /// Parses a key and maps it in one step.
    pub fn resolve(&self, key: &str) -> Result<(ObjectPath, ZnodePath)> {
        let path = ObjectPath::parse(key)?;
        let znode = self.to_znode(&path)?;
        Ok((path, znode))
    }

    /// Maps a znode back to its object path. Only znodes at or below the
    /// root are accepted.
    pub fn to_object(&self, znode: &str) -> Result<ObjectPath> {
        if !znode.starts_with(SEPARATOR) {
            return Err(invalid(znode, "znode paths are absolute"));
        }
        let relative = if self.root.is_ensemble_root() {
            Some(&znode[1..])
        } else if znode == self.root.as_str() {
            Some("")
        } else {
            znode
                .strip_prefix(self.root.as_str())
                .and_then(|rest| rest.strip_prefix(SEPARATOR))
        };
        match relative {
            Some(rest) if rest.is_empty() => Ok(ObjectPath::root()),
            Some(rest) if rest.ends_with(SEPARATOR) => {
                Err(invalid(znode, "trailing separator"))
            }
            Some(rest) => ObjectPath::from_segments(rest.split(SEPARATOR)),
            None => Err(invalid(znode, format!("not under root {}", self.root))),
        }
    }
}

fn is_reserved_subtree(znode: &str) -> bool {
    znode == RESERVED_ROOT
        || znode
            .strip_prefix(RESERVED_ROOT)
            .map_or(false, |rest| rest.starts_with(SEPARATOR))
}
