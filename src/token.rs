//! Exchange tokens.

use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Names one call or subscription on the bus.
///
/// The bus hands out a fresh token per exchange. A service finds the
/// subscription row for an incoming cancel by it, and a caller passes it back
/// to stop receiving replies. Only the transport looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueToken(String);

impl UniqueToken {
    /// Fresh random token (UUID v4 text).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UniqueToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for UniqueToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

// Lets maps keyed by token be queried with a plain `&str`.
impl Borrow<str> for UniqueToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
