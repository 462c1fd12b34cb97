//! Token service: signed device tokens and random URL tokens.
//!
//! Anonymous voters are recognised across requests by a signed device token
//! kept in a cookie. The token is never persisted server-side; only a keyed
//! hash of its device id reaches storage, so the raw id cannot be joined
//! against the database.
//!
//! ## Key Hierarchy
//!
//! ```text
//! master secret (config, 32+ bytes)
//!         │
//!         ▼
//! HKDF-SHA256(salt="ballotbox-master-v1", secret)
//!         │
//!         ├─► HKDF expand("device-token-signing") → HMAC-SHA256 signing key
//!         └─► HKDF expand("device-id-hashing")    → device-id hash key
//! ```
//!
//! - **Domain Separation**: each key purpose uses a unique HKDF info string.
//! - **Versioning**: the token payload and the HKDF salt carry "v1" for
//!   future rotation.
//! - **Zeroization**: derived key material is cleared on drop.
//!
//! Verification failures are values, not errors: a bad token simply yields
//! `None` and the caller issues a fresh one.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Device token format version.
const DEVICE_TOKEN_VERSION: &str = "v1";

/// Device tokens live for 90 days; the cookie max-age matches.
pub const DEVICE_TOKEN_TTL_DAYS: i64 = 90;

/// User agents are truncated to this many characters in the payload.
const USER_AGENT_PREFIX_LEN: usize = 200;

/// Domain separation salt for key derivation (versioned for rotation).
const MASTER_SALT: &[u8] = b"ballotbox-master-v1";

/// HKDF info strings for purpose-specific key derivation.
mod purposes {
    pub const DEVICE_TOKEN_SIGNING: &[u8] = b"device-token-signing";
    pub const DEVICE_ID_HASHING: &[u8] = b"device-id-hashing";
}

/// Derived key material, cleared on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKey([u8; 32]);

/// Signed device-token payload. Serialized as JSON, base64url-encoded, then
/// HMAC'd; the MAC covers the encoded form.
#[derive(Debug, Serialize, Deserialize)]
struct DeviceTokenPayload {
    version: String,
    device_id: String,
    user_agent: String,
    issued_at: i64,
    expires_at: i64,
}

/// A freshly issued device token, ready to be set as a cookie.
#[derive(Debug, Clone)]
pub struct IssuedDeviceToken {
    pub token: String,
    pub device_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of verifying a device token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDevice {
    pub device_id: String,
}

/// Issues and verifies signed device tokens, and hashes device ids for
/// storage.
pub struct TokenService {
    signing_key: hmac::Key,
    hash_key: DerivedKey,
}

impl TokenService {
    /// Derive the signing and hashing keys from the configured master secret.
    pub fn new(master_secret: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(MASTER_SALT), master_secret);

        let mut signing = [0u8; 32];
        hk.expand(purposes::DEVICE_TOKEN_SIGNING, &mut signing)
            .expect("HKDF expand to 32 bytes cannot fail");
        let signing_key = hmac::Key::new(hmac::HMAC_SHA256, &signing);
        signing.zeroize();

        let mut hashing = [0u8; 32];
        hk.expand(purposes::DEVICE_ID_HASHING, &mut hashing)
            .expect("HKDF expand to 32 bytes cannot fail");

        Self {
            signing_key,
            hash_key: DerivedKey(hashing),
        }
    }

    /// Issue a device token for a new browser.
    ///
    /// The payload carries a random 16-byte device id (hex), the truncated
    /// user agent and issue/expiry instants. Format:
    /// `base64url(payload) "." hex(HMAC-SHA256(key, base64url(payload)))`.
    pub fn issue_device_token(&self, user_agent: &str, now: DateTime<Utc>) -> IssuedDeviceToken {
        let mut id_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut id_bytes);
        let device_id = hex::encode(id_bytes);

        let expires_at = now + Duration::days(DEVICE_TOKEN_TTL_DAYS);
        let payload = DeviceTokenPayload {
            version: DEVICE_TOKEN_VERSION.to_string(),
            device_id: device_id.clone(),
            user_agent: user_agent.chars().take(USER_AGENT_PREFIX_LEN).collect(),
            issued_at: now.timestamp(),
            expires_at: expires_at.timestamp(),
        };

        let json = serde_json::to_vec(&payload).expect("payload serialization cannot fail");
        let encoded = URL_SAFE_NO_PAD.encode(json);
        let tag = hmac::sign(&self.signing_key, encoded.as_bytes());

        IssuedDeviceToken {
            token: format!("{}.{}", encoded, hex::encode(tag.as_ref())),
            device_id,
            expires_at,
        }
    }

    /// Verify a device token: constant-time MAC check, then version and
    /// expiry. Returns `None` on any mismatch.
    pub fn verify_device_token(&self, token: &str, now: DateTime<Utc>) -> Option<VerifiedDevice> {
        let (encoded, tag_hex) = token.split_once('.')?;
        let tag = hex::decode(tag_hex).ok()?;
        hmac::verify(&self.signing_key, encoded.as_bytes(), &tag).ok()?;

        let json = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        let payload: DeviceTokenPayload = serde_json::from_slice(&json).ok()?;

        if payload.version != DEVICE_TOKEN_VERSION {
            return None;
        }
        if now.timestamp() >= payload.expires_at {
            return None;
        }

        Some(VerifiedDevice {
            device_id: payload.device_id,
        })
    }

    /// Keyed hash of a device id, truncated to 32 hex chars. This is the
    /// only form of the device id that reaches storage.
    pub fn hash_device_id(&self, device_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(device_id.as_bytes());
        hasher.update(self.hash_key.0);
        let digest = hasher.finalize();
        hex::encode(digest)[..32].to_string()
    }
}

/// Mint an unforgeable URL-safe token: 32 random bytes, base64url without
/// padding. Used for poll admin/public tokens and voter edit tokens.
pub fn mint_url_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn service() -> TokenService {
        TokenService::new(b"test-master-secret-at-least-32-bytes!!")
    }

    #[test]
    fn issue_then_verify_round_trips() {
        let svc = service();
        let now = Utc::now();
        let issued = svc.issue_device_token("Mozilla/5.0 (X11; Linux)", now);

        let verified = svc.verify_device_token(&issued.token, now).unwrap();
        assert_eq!(verified.device_id, issued.device_id);
        assert_eq!(issued.device_id.len(), 32); // 16 bytes hex
    }

    #[test]
    fn expired_token_is_invalid() {
        let svc = service();
        let issued_at = Utc::now() - Duration::days(DEVICE_TOKEN_TTL_DAYS + 1);
        let issued = svc.issue_device_token("ua", issued_at);
        assert!(svc.verify_device_token(&issued.token, Utc::now()).is_none());
    }

    #[test]
    fn token_from_other_secret_is_invalid() {
        let other = TokenService::new(b"a-completely-different-master-secret");
        let issued = other.issue_device_token("ua", Utc::now());
        assert!(service().verify_device_token(&issued.token, Utc::now()).is_none());
    }

    #[test]
    fn garbage_tokens_are_invalid() {
        let svc = service();
        let now = Utc::now();
        assert!(svc.verify_device_token("", now).is_none());
        assert!(svc.verify_device_token("no-dot-here", now).is_none());
        assert!(svc.verify_device_token("abc.nothex!", now).is_none());
        assert!(svc.verify_device_token("abc.deadbeef", now).is_none());
    }

    #[test]
    fn user_agent_is_truncated() {
        let svc = service();
        let long_ua = "x".repeat(1000);
        let issued = svc.issue_device_token(&long_ua, Utc::now());
        // Token verifies; the payload only kept a prefix.
        let (encoded, _) = issued.token.split_once('.').unwrap();
        let json = URL_SAFE_NO_PAD.decode(encoded).unwrap();
        let payload: DeviceTokenPayload = serde_json::from_slice(&json).unwrap();
        assert_eq!(payload.user_agent.len(), USER_AGENT_PREFIX_LEN);
    }

    #[test]
    fn device_id_hash_is_stable_and_truncated() {
        let svc = service();
        let a = svc.hash_device_id("abcdef0123456789");
        let b = svc.hash_device_id("abcdef0123456789");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, svc.hash_device_id("ffffff0123456789"));
    }

    #[test]
    fn device_id_hash_depends_on_secret() {
        let other = TokenService::new(b"a-completely-different-master-secret");
        assert_ne!(
            service().hash_device_id("abcdef0123456789"),
            other.hash_device_id("abcdef0123456789")
        );
    }

    #[test]
    fn minted_url_tokens_are_unique_and_url_safe() {
        let a = mint_url_token();
        let b = mint_url_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43); // 32 bytes base64url, no padding
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn tampered_mac_is_invalid() {
        let svc = service();
        let now = Utc::now();
        let issued = svc.issue_device_token("agent", now);
        let (encoded, tag) = issued.token.split_once('.').unwrap();

        // Replace one hex digit of the tag with a different value.
        let mut tag_bytes: Vec<u8> = tag.bytes().collect();
        tag_bytes[0] = if tag_bytes[0] == b'0' { b'1' } else { b'0' };
        let tampered = format!("{}.{}", encoded, String::from_utf8(tag_bytes).unwrap());
        assert!(svc.verify_device_token(&tampered, now).is_none());
    }

    proptest! {
        /// Any single-byte corruption of the signed payload must fail
        /// verification.
        #[test]
        fn prop_payload_byte_flip_invalidates(pos_seed in 0usize..4096, bit in 0u8..8) {
            let svc = service();
            let now = Utc::now();
            let issued = svc.issue_device_token("agent", now);
            let (encoded, tag) = issued.token.split_once('.').unwrap();

            let mut bytes = encoded.to_string().into_bytes();
            let pos = pos_seed % bytes.len();
            bytes[pos] ^= 1 << bit;

            // The flip may produce invalid UTF-8; either way it must not
            // verify.
            if let Ok(corrupted) = String::from_utf8(bytes) {
                // base64 is case-sensitive, so any payload change alters the
                // MAC input.
                if corrupted != encoded {
                    let tampered = format!("{}.{}", corrupted, tag);
                    prop_assert!(svc.verify_device_token(&tampered, now).is_none());
                }
            }
        }

        #[test]
        fn prop_round_trip_any_user_agent(ua in ".{0,300}") {
            let svc = service();
            let now = Utc::now();
            let issued = svc.issue_device_token(&ua, now);
            prop_assert!(svc.verify_device_token(&issued.token, now).is_some());
        }
    }
}
