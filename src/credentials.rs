//! Username/password verification.
//!
//! The gate only needs a yes/no answer from a credential store, expressed as
//! the [`CredentialVerifier`] trait. [`HtpasswdFile`] is the shipped
//! implementation, reading Apache htpasswd content.
//!
//! # Supported hash schemes
//!
//! | Prefix | Scheme |
//! |--------|--------|
//! | `$2y$` / `$2a$` / `$2b$` | bcrypt |
//! | `$apr1$` | Apache MD5 crypt |
//! | `{SHA}` | base64 SHA-1 |
//! | `{SSHA}` | base64 salted SHA-1 |
//!
//! Lines using anything else are skipped with a warning.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Checks a username/password pair.
///
/// Every failure (unknown user, wrong password, unreadable hash) is `false`;
/// callers never learn why.
pub trait CredentialVerifier: Send + Sync {
    /// Returns `true` only when the password is correct for `username`.
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// In-memory htpasswd credential store.
#[derive(Debug, Clone, Default)]
pub struct HtpasswdFile {
    entries: HashMap<String, PasswordHash>,
}

#[derive(Debug, Clone)]
enum PasswordHash {
    Bcrypt(String),
    Apr1 { salt: String, encoded: String },
    Sha(Vec<u8>),
    Ssha { digest: Vec<u8>, salt: Vec<u8> },
}

impl HtpasswdFile {
    /// Parse htpasswd content.
    ///
    /// Blank lines and `#` comments are ignored; malformed lines and lines
    /// with unsupported schemes are skipped with a warning. A later entry for
    /// the same user replaces an earlier one.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((user, hash)) = line.split_once(':') else {
                warn!(line = index + 1, "Skipping htpasswd line without ':'");
                continue;
            };

            match PasswordHash::parse(hash) {
                Some(parsed) => {
                    entries.insert(user.to_string(), parsed);
                }
                None => {
                    warn!(line = index + 1, user = %user, "Skipping htpasswd entry with unsupported hash");
                }
            }
        }

        debug!(users = entries.len(), "Loaded htpasswd entries");
        Self { entries }
    }

    /// Read and parse an htpasswd file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read users file '{}': {e}",
                path.display()
            ))
        })?;
        Ok(Self::parse(&content))
    }

    /// Number of usable entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no usable entries were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CredentialVerifier for HtpasswdFile {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.entries
            .get(username)
            .is_some_and(|hash| hash.matches(password.as_bytes()))
    }
}

impl PasswordHash {
    fn parse(hash: &str) -> Option<Self> {
        let hash = hash.trim();

        if ["$2y$", "$2a$", "$2b$"].iter().any(|p| hash.starts_with(p)) {
            return Some(Self::Bcrypt(hash.to_string()));
        }

        if let Some(rest) = hash.strip_prefix(APR1_MAGIC) {
            let (salt, encoded) = rest.split_once('$')?;
            if salt.len() > 8 || encoded.is_empty() {
                return None;
            }
            return Some(Self::Apr1 {
                salt: salt.to_string(),
                encoded: hash.to_string(),
            });
        }

        if let Some(b64) = hash.strip_prefix("{SHA}") {
            let digest = STANDARD.decode(b64).ok()?;
            return (digest.len() == SHA1_LEN).then_some(Self::Sha(digest));
        }

        if let Some(b64) = hash.strip_prefix("{SSHA}") {
            let raw = STANDARD.decode(b64).ok()?;
            if raw.len() <= SHA1_LEN {
                return None;
            }
            let (digest, salt) = raw.split_at(SHA1_LEN);
            return Some(Self::Ssha {
                digest: digest.to_vec(),
                salt: salt.to_vec(),
            });
        }

        None
    }

    fn matches(&self, password: &[u8]) -> bool {
        match self {
            Self::Bcrypt(hash) => bcrypt::verify(password, hash).unwrap_or(false),
            Self::Apr1 { salt, encoded } => {
                let computed = apr1_crypt(password, salt.as_bytes());
                computed.as_bytes().ct_eq(encoded.as_bytes()).into()
            }
            Self::Sha(digest) => Sha1::digest(password).as_slice().ct_eq(digest).into(),
            Self::Ssha { digest, salt } => {
                let mut hasher = Sha1::new();
                hasher.update(password);
                hasher.update(salt);
                hasher.finalize().as_slice().ct_eq(digest).into()
            }
        }
    }
}

const SHA1_LEN: usize = 20;
const APR1_MAGIC: &str = "$apr1$";
const CRYPT_ALPHABET: &[u8; 64] =
    b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Apache MD5 crypt (`$apr1$salt$hash`).
pub(crate) fn apr1_crypt(password: &[u8], salt: &[u8]) -> String {
    let salt = &salt[..salt.len().min(8)];

    let mut alternate = Md5::new();
    alternate.update(password);
    alternate.update(salt);
    alternate.update(password);
    let alternate = alternate.finalize();

    let mut ctx = Md5::new();
    ctx.update(password);
    ctx.update(APR1_MAGIC.as_bytes());
    ctx.update(salt);

    for chunk_start in (0..password.len()).step_by(16) {
        let take = (password.len() - chunk_start).min(16);
        ctx.update(&alternate[..take]);
    }

    let mut bits = password.len();
    while bits > 0 {
        if bits & 1 == 1 {
            ctx.update([0u8]);
        } else {
            ctx.update(&password[..1]);
        }
        bits >>= 1;
    }

    let mut round = [0u8; 16];
    round.copy_from_slice(&ctx.finalize());

    for i in 0..1000 {
        let mut ctx = Md5::new();
        if i & 1 == 1 {
            ctx.update(password);
        } else {
            ctx.update(round);
        }
        if i % 3 != 0 {
            ctx.update(salt);
        }
        if i % 7 != 0 {
            ctx.update(password);
        }
        if i & 1 == 1 {
            ctx.update(round);
        } else {
            ctx.update(password);
        }
        round.copy_from_slice(&ctx.finalize());
    }

    let mut out = String::with_capacity(APR1_MAGIC.len() + salt.len() + 23);
    out.push_str(APR1_MAGIC);
    out.push_str(&String::from_utf8_lossy(salt));
    out.push('$');

    for (a, b, c) in [(0, 6, 12), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)] {
        let value =
            (u32::from(round[a]) << 16) | (u32::from(round[b]) << 8) | u32::from(round[c]);
        push_crypt64(&mut out, value, 4);
    }
    push_crypt64(&mut out, u32::from(round[11]), 2);

    out
}

fn push_crypt64(out: &mut String, mut value: u32, count: usize) {
    for _ in 0..count {
        out.push(char::from(CRYPT_ALPHABET[(value & 0x3f) as usize]));
        value >>= 6;
    }
}
