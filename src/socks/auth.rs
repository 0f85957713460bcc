//! SOCKS5 authentication policy
//!
//! Selects the negotiation method the server insists on and verifies
//! RFC 1929 credentials. Dynamic passwords are checked through an
//! externally supplied provider.

use super::consts::*;
use std::fmt;
use std::sync::Arc;

/// External dynamic-password verifier.
///
/// Implementations are supplied by the embedding application; the server
/// calls them synchronously from the sub-negotiation step.
pub trait DynamicAuth: Send + Sync {
    /// Check a username/password pair.
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// How a connection must authenticate.
#[derive(Clone)]
pub enum AuthPolicy {
    /// Accept only the no-authentication method
    NoAuth,
    /// Username/password checked against configured credentials
    Static {
        /// Expected username
        username: String,
        /// Expected password
        password: String,
    },
    /// Username/password checked by an external provider
    Dynamic(Arc<dyn DynamicAuth>),
}

impl AuthPolicy {
    /// Whether this policy skips the sub-negotiation entirely.
    pub fn is_no_auth(&self) -> bool {
        matches!(self, AuthPolicy::NoAuth)
    }

    /// The single method byte this policy accepts during negotiation.
    pub fn required_method(&self) -> u8 {
        if self.is_no_auth() {
            SOCKS5_AUTH_METHOD_NONE
        } else {
            SOCKS5_AUTH_METHOD_PASSWORD
        }
    }

    /// Verify a received username/password pair.
    pub fn verify(&self, username: &[u8], password: &[u8]) -> bool {
        match self {
            AuthPolicy::NoAuth => true,
            AuthPolicy::Static {
                username: expected_user,
                password: expected_pass,
            } => username == expected_user.as_bytes() && password == expected_pass.as_bytes(),
            AuthPolicy::Dynamic(provider) => {
                match (std::str::from_utf8(username), std::str::from_utf8(password)) {
                    (Ok(user), Ok(pass)) => provider.authenticate(user, pass),
                    _ => false,
                }
            }
        }
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPolicy::NoAuth => f.write_str("NoAuth"),
            AuthPolicy::Static { username, .. } => {
                f.debug_struct("Static").field("username", username).finish()
            }
            AuthPolicy::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectAll;
    impl DynamicAuth for RejectAll {
        fn authenticate(&self, _username: &str, _password: &str) -> bool {
            false
        }
    }

    struct AcceptPair;
    impl DynamicAuth for AcceptPair {
        fn authenticate(&self, username: &str, password: &str) -> bool {
            username == "dyn" && password == "amic"
        }
    }

    #[test]
    fn test_required_method() {
        assert_eq!(AuthPolicy::NoAuth.required_method(), SOCKS5_AUTH_METHOD_NONE);
        let policy = AuthPolicy::Static {
            username: "u".to_string(),
            password: "p".to_string(),
        };
        assert_eq!(policy.required_method(), SOCKS5_AUTH_METHOD_PASSWORD);
        assert!(!policy.is_no_auth());
    }

    #[test]
    fn test_static_verify() {
        let policy = AuthPolicy::Static {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        assert!(policy.verify(b"user", b"pass"));
        assert!(!policy.verify(b"user", b"wrong"));
        assert!(!policy.verify(b"other", b"pass"));
        assert!(!policy.verify(b"", b""));
    }

    #[test]
    fn test_dynamic_verify() {
        let policy = AuthPolicy::Dynamic(Arc::new(AcceptPair));
        assert!(policy.verify(b"dyn", b"amic"));
        assert!(!policy.verify(b"dyn", b"wrong"));

        let policy = AuthPolicy::Dynamic(Arc::new(RejectAll));
        assert!(!policy.verify(b"any", b"thing"));
    }

    #[test]
    fn test_dynamic_verify_rejects_invalid_utf8() {
        let policy = AuthPolicy::Dynamic(Arc::new(AcceptPair));
        assert!(!policy.verify(&[0xFF, 0xFE], b"amic"));
        assert!(!policy.verify(b"dyn", &[0xFF]));
    }

    #[test]
    fn test_debug_does_not_leak_password() {
        let policy = AuthPolicy::Static {
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        let rendered = format!("{:?}", policy);
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("secret"));
    }
}
