//! Cookie-backed sessions.
//!
//! A session is a client-held, server-signed record of a verified identity.
//! Nothing is stored server side: [`CookieSessionStore`] signs the identity
//! into a cookie on [`save`](SessionStore::save) and verifies it again on
//! every [`load`](SessionStore::load).
//!
//! # Cookie value
//!
//! ```text
//! base64url(payload) "." base64url(HMAC-SHA256(key, name "|" base64url(payload)))
//! ```
//!
//! `payload` is `{"user": Identity | null, "iat": <unix seconds>}`. The cookie
//! name is bound into the tag so a value cannot be replayed under another
//! cookie name.

use std::fmt;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, KeyInit, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::CookieConfig;
use crate::identity::Identity;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Session lifetime: one year from issuance.
pub const SESSION_MAX_AGE_SECS: i64 = 60 * 60 * 24 * 365;

/// Required length of the signing secret
pub const SESSION_KEY_LEN: usize = 32;

/// Tolerated clock skew for `iat` values from the future
const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Reads and writes the authenticated identity of a request.
pub trait SessionStore: Send + Sync {
    /// Identity carried by the request, if it holds a valid session.
    ///
    /// Missing, tampered, expired or unparsable sessions all yield `None`.
    fn load(&self, headers: &HeaderMap) -> Option<Identity>;

    /// Persist `identity` by adding `Set-Cookie` headers to the response.
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if the session cannot be encoded.
    fn save(&self, identity: &Identity, response_headers: &mut HeaderMap) -> Result<()>;
}

/// 32-byte secret used to sign session cookies.
#[derive(Clone)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Wrap raw key bytes
    #[must_use]
    pub fn new(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random key from the TLS provider's secure RNG.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the system RNG fails.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        rustls::crypto::aws_lc_rs::default_provider()
            .secure_random
            .fill(&mut bytes)
            .map_err(|_| Error::config("failed to generate a random session key"))?;
        Ok(Self(bytes))
    }

    /// Use the configured key, or generate one when it is missing or not
    /// exactly 32 bytes long.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a key has to be generated and the RNG fails.
    pub fn from_config(configured: Option<&str>) -> Result<Self> {
        match configured.map(str::as_bytes) {
            Some(bytes) if bytes.len() == SESSION_KEY_LEN => {
                let mut key = [0u8; SESSION_KEY_LEN];
                key.copy_from_slice(bytes);
                Ok(Self(key))
            }
            _ => {
                warn!("cookie key is empty or has an invalid length, need a 32 byte key");
                warn!("a random key has been generated; sessions will not survive a restart");
                Self::generate()
            }
        }
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([redacted])")
    }
}

/// Attributes written on the session cookie.
#[derive(Debug, Clone)]
pub struct CookieOptions {
    /// Cookie name
    pub name: String,
    /// `Domain` attribute
    pub domain: String,
    /// `Path` attribute
    pub path: String,
    /// `Max-Age` in seconds
    pub max_age: i64,
    /// `Secure` attribute
    pub secure: bool,
    /// `HttpOnly` attribute
    pub http_only: bool,
}

impl CookieOptions {
    /// Cookie options from configuration, scoped to `domain`.
    #[must_use]
    pub fn from_config(config: &CookieConfig, domain: &str) -> Self {
        Self {
            name: config.name.clone(),
            domain: domain.to_string(),
            path: config.path.clone(),
            max_age: SESSION_MAX_AGE_SECS,
            secure: config.secure,
            http_only: config.http_only,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionPayload {
    user: Option<Identity>,
    iat: i64,
}

/// [`SessionStore`] that keeps the identity in an HMAC-signed cookie.
#[derive(Debug, Clone)]
pub struct CookieSessionStore {
    key: SessionKey,
    options: CookieOptions,
}

impl CookieSessionStore {
    /// Create a store signing with `key`.
    #[must_use]
    pub fn new(key: SessionKey, options: CookieOptions) -> Self {
        Self { key, options }
    }

    /// Encode a signed cookie value for `identity` issued at `issued_at`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if the payload cannot be serialized.
    pub fn encode(&self, identity: &Identity, issued_at: DateTime<Utc>) -> Result<String> {
        let payload = SessionPayload {
            user: Some(identity.clone()),
            iat: issued_at.timestamp(),
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);
        let mac = self
            .mac(&payload)
            .ok_or_else(|| Error::Session("session key rejected by HMAC".to_string()))?;
        let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{tag}"))
    }

    /// Verify and decode a cookie value as of `now`.
    #[must_use]
    pub fn decode(&self, value: &str, now: DateTime<Utc>) -> Option<Identity> {
        let (payload, tag) = value.split_once('.')?;
        let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;

        if self.mac(payload)?.verify_slice(&tag).is_err() {
            debug!(cookie = %self.options.name, "Session cookie signature mismatch");
            return None;
        }

        let raw = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let session: SessionPayload = serde_json::from_slice(&raw).ok()?;

        let age = now.timestamp() - session.iat;
        if age > self.options.max_age || age < -MAX_CLOCK_SKEW_SECS {
            debug!(cookie = %self.options.name, age, "Session cookie expired");
            return None;
        }

        session.user
    }

    fn mac(&self, payload: &str) -> Option<HmacSha256> {
        let mut mac = <HmacSha256 as KeyInit>::new_from_slice(&self.key.0).ok()?;
        mac.update(self.options.name.as_bytes());
        mac.update(b"|");
        mac.update(payload.as_bytes());
        Some(mac)
    }

    fn set_cookie_header(&self, value: &str, now: DateTime<Utc>) -> String {
        let options = &self.options;
        let expires = now + Duration::seconds(options.max_age);

        let mut cookie = format!(
            "{}={value}; Path={}; Domain={}; Expires={}; Max-Age={}",
            options.name,
            options.path,
            options.domain,
            expires.format("%a, %d %b %Y %H:%M:%S GMT"),
            options.max_age,
        );
        if options.http_only {
            cookie.push_str("; HttpOnly");
        }
        if options.secure {
            cookie.push_str("; Secure");
        }
        cookie.push_str("; SameSite=Lax");
        cookie
    }

    /// Find this store's cookie among the request's `Cookie` headers.
    fn cookie_value<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.options.name)
            .map(|(_, value)| value.trim_matches('"'))
    }
}

impl SessionStore for CookieSessionStore {
    fn load(&self, headers: &HeaderMap) -> Option<Identity> {
        let value = self.cookie_value(headers)?;
        self.decode(value, Utc::now())
    }

    fn save(&self, identity: &Identity, response_headers: &mut HeaderMap) -> Result<()> {
        let now = Utc::now();
        let value = self.encode(identity, now)?;
        let header = HeaderValue::from_str(&self.set_cookie_header(&value, now))
            .map_err(|e| Error::Session(format!("invalid Set-Cookie header: {e}")))?;
        response_headers.append(SET_COOKIE, header);
        Ok(())
    }
}
