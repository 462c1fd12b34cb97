//! Voter identity resolution.
//!
//! Every vote-touching request maps to exactly one canonical [`VoterKey`]:
//! `user:<id>` for authenticated sessions, `device:<hash>` for anonymous
//! browsers carrying (or just issued) a signed device token. Resolution
//! never fails: a request with no usable identity gets a fresh device
//! token and the key derived from it.
//!
//! The voter key is orthogonal to the voter edit token: the key identifies
//! "the same voter" for dedup and signup rules; the edit token is a
//! secret-by-possession handle for later edits via URL alone.

use chrono::{DateTime, Utc};

use crate::model::User;
use crate::token::{IssuedDeviceToken, TokenService};

/// Canonical voter identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VoterKey {
    /// Authenticated user id.
    User(i64),
    /// Hashed device id of an anonymous browser.
    Device(String),
}

impl VoterKey {
    /// Storage form: `user:<id>` or `device:<hash>`.
    pub fn as_string(&self) -> String {
        match self {
            VoterKey::User(id) => format!("user:{}", id),
            VoterKey::Device(hash) => format!("device:{}", hash),
        }
    }
}

impl std::fmt::Display for VoterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// Where the key came from, for logging and cookie handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Session,
    Device,
    FreshDevice,
}

/// A resolved requester identity.
#[derive(Debug, Clone)]
pub struct VoterIdentity {
    pub key: VoterKey,
    pub source: IdentitySource,
    pub user: Option<User>,
    /// Present when a new device token was minted; the handler must set the
    /// cookie.
    pub issued_token: Option<IssuedDeviceToken>,
}

impl VoterIdentity {
    pub fn user_id(&self) -> Option<i64> {
        self.user.as_ref().map(|u| u.id)
    }
}

/// Resolves requests to voter identities. Stateless besides the token
/// service.
pub struct IdentityResolver<'a> {
    tokens: &'a TokenService,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(tokens: &'a TokenService) -> Self {
        Self { tokens }
    }

    /// Resolution order, first match wins: session user, valid device
    /// cookie, freshly issued device token.
    pub fn resolve(
        &self,
        session_user: Option<User>,
        device_cookie: Option<&str>,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> VoterIdentity {
        if let Some(user) = session_user {
            return VoterIdentity {
                key: VoterKey::User(user.id),
                source: IdentitySource::Session,
                user: Some(user),
                issued_token: None,
            };
        }

        if let Some(cookie) = device_cookie {
            if let Some(device) = self.tokens.verify_device_token(cookie, now) {
                return VoterIdentity {
                    key: VoterKey::Device(self.tokens.hash_device_id(&device.device_id)),
                    source: IdentitySource::Device,
                    user: None,
                    issued_token: None,
                };
            }
        }

        let issued = self.tokens.issue_device_token(user_agent, now);
        VoterIdentity {
            key: VoterKey::Device(self.tokens.hash_device_id(&issued.device_id)),
            source: IdentitySource::FreshDevice,
            user: None,
            issued_token: Some(issued),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> TokenService {
        TokenService::new(b"identity-test-master-secret-32-bytes")
    }

    fn user(id: i64) -> User {
        User {
            id,
            email: format!("user{}@x.test", id),
            display_name: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn session_wins_over_device_cookie() {
        let tokens = tokens();
        let resolver = IdentityResolver::new(&tokens);
        let now = Utc::now();
        let cookie = tokens.issue_device_token("ua", now).token;

        let identity = resolver.resolve(Some(user(7)), Some(&cookie), "ua", now);
        assert_eq!(identity.key, VoterKey::User(7));
        assert_eq!(identity.source, IdentitySource::Session);
        assert!(identity.issued_token.is_none());
    }

    #[test]
    fn valid_cookie_yields_stable_device_key() {
        let tokens = tokens();
        let resolver = IdentityResolver::new(&tokens);
        let now = Utc::now();
        let cookie = tokens.issue_device_token("ua", now).token;

        let first = resolver.resolve(None, Some(&cookie), "ua", now);
        let second = resolver.resolve(None, Some(&cookie), "ua", now);
        assert_eq!(first.key, second.key);
        assert_eq!(first.source, IdentitySource::Device);
        assert!(matches!(first.key, VoterKey::Device(_)));
    }

    #[test]
    fn missing_or_forged_cookie_issues_a_fresh_token() {
        let tokens = tokens();
        let resolver = IdentityResolver::new(&tokens);
        let now = Utc::now();

        let fresh = resolver.resolve(None, None, "ua", now);
        assert_eq!(fresh.source, IdentitySource::FreshDevice);
        let issued = fresh.issued_token.expect("fresh token issued");

        // The issued cookie resolves to the same key on the next request.
        let again = resolver.resolve(None, Some(&issued.token), "ua", now);
        assert_eq!(again.key, fresh.key);
        assert_eq!(again.source, IdentitySource::Device);

        let forged = resolver.resolve(None, Some("garbage.cookie"), "ua", now);
        assert_eq!(forged.source, IdentitySource::FreshDevice);
        assert_ne!(forged.key, fresh.key);
    }

    #[test]
    fn key_strings_have_the_canonical_prefixes() {
        assert_eq!(VoterKey::User(12).as_string(), "user:12");
        assert!(VoterKey::Device("abc".into()).as_string().starts_with("device:"));
    }
}
