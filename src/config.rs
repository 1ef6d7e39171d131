//! Configuration management
//!
//! Configuration is read once at startup from a YAML file and `TRAUTH_*`
//! environment variables (nested keys separated by `__`, e.g.
//! `TRAUTH_COOKIE__SECURE=true`). [`Config::validate`] performs the cheap
//! structural checks; compiling rules, loading the CA bundle and the
//! credential store happens in [`AuthEngine::from_config`](crate::gate::AuthEngine::from_config).

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Cookie domain; also reported by the authenticated handler
    pub domain: String,
    /// Inline htpasswd content
    pub users: Option<String>,
    /// Path to an htpasswd file
    pub users_file: Option<String>,
    /// Authentication bypass rules
    pub rules: Vec<RuleConfig>,
    /// Session cookie settings
    pub cookie: CookieConfig,
    /// Realm sent in the Basic challenge
    pub realm: String,
    /// PEM bundle of CAs trusted for client certificates
    pub ca_path: Option<String>,
    /// Optional PEM certificate revocation list for client certificates
    pub crl_path: Option<String>,
    /// Read client address, host, URI and scheme from `X-Forwarded-*`
    /// headers. Only enable behind a proxy that overwrites them.
    pub trust_forwarded_headers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            domain: String::new(),
            users: None,
            users_file: None,
            rules: Vec::new(),
            cookie: CookieConfig::default(),
            realm: default_realm(),
            ca_path: None,
            crl_path: None,
            trust_forwarded_headers: false,
        }
    }
}

fn default_realm() -> String {
    "Restricted".to_string()
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// TLS listener; required for client certificates to reach the gate
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tls: None,
        }
    }
}

/// TLS listener certificate and key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    /// PEM server certificate chain
    pub cert: String,
    /// PEM server private key
    pub key: String,
}

/// Session cookie settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Cookie name
    pub name: String,
    /// Cookie path
    pub path: String,
    /// Set the `Secure` attribute
    pub secure: bool,
    /// Set the `HttpOnly` attribute
    pub http_only: bool,
    /// 32-byte signing secret. Generated at startup when missing or of the
    /// wrong length, which invalidates sessions on every restart.
    pub key: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "trauth".to_string(),
            path: "/".to_string(),
            secure: false,
            http_only: false,
            key: None,
        }
    }
}

/// A bypass rule as written in configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Host the rule applies to (exact match)
    pub domain: String,
    /// Exclusions; any one matching bypasses authentication
    pub excludes: Vec<ExcludeConfig>,
}

/// One exclusion as written in configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcludeConfig {
    /// Regular expression matched against the request path
    pub path: Option<String>,
    /// CIDR matched against the request source address
    pub ipnet: Option<String>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("TRAUTH_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Structural validation that needs no file access.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(Error::config("a cookie domain has not been configured"));
        }

        if self.users.is_some() && self.users_file.is_some() {
            return Err(Error::config(format!(
                "both users and users_file are set for '{}'",
                self.domain
            )));
        }

        validate_realm(&self.realm)?;

        if self.cookie.name.is_empty()
            || !self
                .cookie
                .name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"-_.".contains(&b))
        {
            return Err(Error::config(format!(
                "invalid cookie name '{}'",
                self.cookie.name
            )));
        }

        Ok(())
    }

    /// Whether a credential store is configured
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.users.is_some() || self.users_file.is_some()
    }
}

/// Reject realms that cannot sit inside `Basic realm="..."`.
///
/// # Errors
///
/// Returns `Error::Config` for a quote or a control character.
pub fn validate_realm(realm: &str) -> Result<()> {
    if realm.contains('"') || realm.chars().any(char::is_control) {
        return Err(Error::config(format!(
            "realm '{}' must not contain quotes or control characters",
            realm.escape_default()
        )));
    }
    Ok(())
}
