//! Object path parsing
//!
//! Handles parsing of object paths in the format: space/key
//! where `space` names a storage space and `key` is the object key inside it.

use crate::error::{Error, Result};

/// A parsed path pointing to an object inside a storage space
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    /// Storage space name
    pub space: String,
    /// Object key (empty for the space root)
    pub key: String,
}

impl ObjectPath {
    /// Create a new ObjectPath, stripping leading slashes from the key
    pub fn new(space: impl Into<String>, key: impl AsRef<str>) -> Self {
        Self {
            space: space.into(),
            key: normalize_key(key.as_ref()),
        }
    }

    /// Whether the path names a space or a prefix rather than an object
    pub fn is_dir(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('/')
    }
}

impl std::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}", self.space)
        } else {
            write!(f, "{}/{}", self.space, self.key)
        }
    }
}

impl std::str::FromStr for ObjectPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_object_path(s)
    }
}

/// Parse a `space/key` string into an ObjectPath
pub fn parse_object_path(path: &str) -> Result<ObjectPath> {
    if path.is_empty() {
        return Err(Error::InvalidPath("Path cannot be empty".into()));
    }

    let path = path.trim_start_matches('/');
    let (space, key) = match path.split_once('/') {
        Some((space, key)) => (space, key),
        None => (path, ""),
    };

    if !is_valid_space_name(space) {
        return Err(Error::InvalidPath(format!(
            "Invalid space name '{space}'. Use format: space[/key]"
        )));
    }

    Ok(ObjectPath::new(space, key))
}

/// Strip leading slashes; object keys are always relative to their space
pub fn normalize_key(key: &str) -> String {
    key.trim_start_matches('/').to_string()
}

/// Check if a string is a valid space name
pub fn is_valid_space_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
