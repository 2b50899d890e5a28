//! Authorization artifact forwarded with every backend request
//!
//! The engine never interprets the token; backends decide how to attach it.

use std::fmt;

/// Opaque bearer credential attached to each transport call
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Authorization {
    /// No credential; only public spaces are readable
    #[default]
    Anonymous,
    /// Bearer token
    Bearer(String),
}

impl Authorization {
    /// Build from an optional token, treating blank tokens as anonymous
    pub fn from_token(token: Option<impl Into<String>>) -> Self {
        match token.map(Into::into) {
            Some(token) if !token.trim().is_empty() => Authorization::Bearer(token),
            _ => Authorization::Anonymous,
        }
    }

    /// The raw token, if any
    pub fn token(&self) -> Option<&str> {
        match self {
            Authorization::Anonymous => None,
            Authorization::Bearer(token) => Some(token),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Authorization::Anonymous)
    }
}

// Tokens must never end up in logs.
impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorization::Anonymous => f.write_str("Anonymous"),
            Authorization::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}
