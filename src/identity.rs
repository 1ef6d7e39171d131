//! Authenticated identity carried in the session cookie.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A user's session identity.
///
/// The only way to get an authenticated identity is [`Identity::authenticated`],
/// which callers invoke after a credential or certificate check succeeded.
/// The default value is the unauthenticated state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Username (Basic auth user or certificate common name)
    pub username: String,
    /// Whether the identity was verified
    pub authenticated: bool,
}

impl Identity {
    /// Identity for a user whose credentials were just verified.
    pub fn authenticated(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            authenticated: true,
        }
    }

    /// `true` when this identity can skip re-authentication.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated && !self.username.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

/// How an identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Client certificate verified against the trust anchor
    Mtls,
    /// HTTP Basic credentials verified against the credential store
    Basic,
}

impl AuthMethod {
    /// Short label for logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mtls => "mtls",
            Self::Basic => "basic",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_identity_is_unauthenticated() {
        let id = Identity::default();
        assert!(!id.authenticated);
        assert!(!id.is_authenticated());
    }

    #[test]
    fn authenticated_identity_carries_username() {
        let id = Identity::authenticated("alice");
        assert_eq!(id.username, "alice");
        assert!(id.is_authenticated());
    }

    #[test]
    fn empty_username_is_never_authenticated() {
        let id = Identity {
            username: String::new(),
            authenticated: true,
        };
        assert!(!id.is_authenticated());
    }

    #[test]
    fn identity_serializes_with_plain_field_names() {
        let json = serde_json::to_value(Identity::authenticated("bob")).unwrap();
        assert_eq!(json["username"], "bob");
        assert_eq!(json["authenticated"], true);
    }
}
