//! Storage spaces
//!
//! A storage space is a named partition of the remote store with its own
//! access policy. Public spaces can be read anonymously; everything else,
//! and every write, needs a bearer token.

use serde::{Deserialize, Serialize};

use crate::auth::Authorization;
use crate::error::{Error, Result};
use crate::path::is_valid_space_name;

/// Read policy of a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Public,
    Private,
}

/// Kind of operation checked against a space's policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// A named storage space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Space {
    name: String,
    access: Access,
}

impl Space {
    /// Create a space, validating its name
    pub fn new(name: impl Into<String>, access: Access) -> Result<Self> {
        let name = name.into();
        if !is_valid_space_name(&name) {
            return Err(Error::InvalidPath(format!("Invalid space name '{name}'")));
        }
        Ok(Self { name, access })
    }

    /// Resolve a space by name against the list of public space names
    pub fn resolve(name: impl Into<String>, public_spaces: &[String]) -> Result<Self> {
        let name = name.into();
        let access = if public_spaces.iter().any(|p| *p == name) {
            Access::Public
        } else {
            Access::Private
        };
        Self::new(name, access)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Fail fast when an operation needs a token that was not supplied
    pub fn check(&self, op: Operation, auth: &Authorization, resource: &str) -> Result<()> {
        let needs_token = !(op == Operation::Read && self.access == Access::Public);
        if needs_token && auth.is_anonymous() {
            return Err(Error::Auth(format!(
                "The resource Storage[{}].{resource} requires a valid token",
                self.name
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
