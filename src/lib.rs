//! trauth library
//!
//! A request-authentication gate for reverse-proxy deployments. Each request
//! is either exempted by a per-domain bypass rule, resumed from a signed
//! session cookie, or authenticated with a client certificate or HTTP Basic
//! credentials, after which a session is issued and the client redirected to
//! its original URI.
//!
//! # Features
//!
//! - **Bypass rules**: exact-host rules with path-regex and CIDR exclusions
//! - **mTLS**: client certificates verified against an operator CA (with CRLs)
//! - **Basic auth**: htpasswd store (bcrypt, apr1, SHA, SSHA)
//! - **Sessions**: HMAC-signed cookies, one year lifetime
//! - **Forward auth**: honours `X-Forwarded-*` from a trusted proxy
//!
//! The engine ([`gate::AuthEngine`]) can be layered onto any axum router with
//! [`gate::auth_middleware`], or run standalone with [`gate::Server`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gate;
pub mod identity;
pub mod mtls;
pub mod rules;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Config(format!("failed to initialise logging: {e}")))
}
