//! Caller identity resolution.
//!
//! A request resolves to `user:<public key hex>` when it carries a valid
//! session token, and to `anon:<keyed hash>` of its network address
//! otherwise. The raw address never leaves this module.
//!
//! # Session Tokens
//!
//! ```text
//! <public_key_hex>.<expires_unix>.<signature_hex>
//! ```
//!
//! The signature is Ed25519 over `echoes-session:<public_key_hex>:<expires_unix>`.

use crate::storage::Store;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use std::sync::Arc;

const SESSION_CONTEXT: &str = "echoes-session";
const ADDRESS_KEY_CONTEXT: &str = "echoes 2025-01-01 anonymous address key";

/// What a request tells us about its caller.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Bearer token, if any
    pub bearer_token: Option<String>,

    /// Best-known client address
    pub address: String,
}

impl CallerContext {
    pub fn anonymous(address: impl Into<String>) -> Self {
        Self {
            bearer_token: None,
            address: address.into(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// A resolved caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable key for quota and abuse tracking
    pub identifier: String,

    /// Carries a verified session
    pub is_authenticated: bool,

    /// Registered admin; exempt from quotas
    pub is_privileged: bool,

    /// Verified public key (hex)
    pub public_key: Option<String>,
}

/// Verifies bearer tokens.
pub trait TokenVerifier: Send + Sync {
    /// The verified public key (hex), or `None` for any failure.
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Option<String>;
}

fn session_message(public_key_hex: &str, expires_unix: i64) -> String {
    format!("{}:{}:{}", SESSION_CONTEXT, public_key_hex, expires_unix)
}

/// Sign a session token for `key`, valid until `expires_at`.
pub fn issue_session_token(key: &SigningKey, expires_at: DateTime<Utc>) -> String {
    let public_key_hex = hex::encode(key.verifying_key().as_bytes());
    let expires_unix = expires_at.timestamp();
    let signature = key.sign(session_message(&public_key_hex, expires_unix).as_bytes());
    format!(
        "{}.{}.{}",
        public_key_hex,
        expires_unix,
        hex::encode(signature.to_bytes())
    )
}

/// Ed25519 session tokens.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionTokenVerifier;

impl TokenVerifier for SessionTokenVerifier {
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Option<String> {
        let mut parts = token.trim().split('.');
        let (public_key_hex, expires, signature_hex) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let expires_unix: i64 = expires.parse().ok()?;
        if expires_unix <= now.timestamp() {
            return None;
        }

        let public_key: [u8; 32] = hex::decode(public_key_hex).ok()?.try_into().ok()?;
        let signature: [u8; 64] = hex::decode(signature_hex).ok()?.try_into().ok()?;
        let verifying_key = VerifyingKey::from_bytes(&public_key).ok()?;
        let signature = Signature::from_bytes(&signature);
        verifying_key
            .verify_strict(
                session_message(public_key_hex, expires_unix).as_bytes(),
                &signature,
            )
            .ok()?;

        Some(public_key_hex.to_lowercase())
    }
}

/// Maps requests to identities.
pub struct IdentityResolver {
    address_key: [u8; 32],
    verifier: Arc<dyn TokenVerifier>,
    store: Arc<dyn Store>,
}

impl IdentityResolver {
    /// `salt` keys the address hash; changing it re-keys every anonymous caller.
    pub fn new(salt: &str, verifier: Arc<dyn TokenVerifier>, store: Arc<dyn Store>) -> Self {
        Self {
            address_key: blake3::derive_key(ADDRESS_KEY_CONTEXT, salt.as_bytes()),
            verifier,
            store,
        }
    }

    /// Resolve a caller. Never fails; anything unverifiable is anonymous.
    pub fn resolve(&self, caller: &CallerContext, now: DateTime<Utc>) -> Identity {
        let verified = caller
            .bearer_token
            .as_deref()
            .and_then(|token| self.verifier.verify(token, now));

        match verified {
            Some(public_key) => {
                let is_privileged = self.store.is_admin(&public_key).unwrap_or_else(|e| {
                    tracing::warn!("Admin lookup failed, treating as unprivileged: {}", e);
                    false
                });
                Identity {
                    identifier: format!("user:{}", public_key),
                    is_authenticated: true,
                    is_privileged,
                    public_key: Some(public_key),
                }
            }
            None => {
                if caller.bearer_token.is_some() {
                    tracing::debug!("Bearer token rejected, resolving as anonymous");
                }
                Identity {
                    identifier: self.anonymous_identifier(&caller.address),
                    is_authenticated: false,
                    is_privileged: false,
                    public_key: None,
                }
            }
        }
    }

    fn anonymous_identifier(&self, address: &str) -> String {
        let hash = blake3::keyed_hash(&self.address_key, address.trim().as_bytes());
        format!("anon:{}", hex::encode(&hash.as_bytes()[..16]))
    }
}
