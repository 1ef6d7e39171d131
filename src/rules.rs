//! Authentication bypass rules.
//!
//! Compiles the `rules` list from [`Config`](crate::config::Config) into a
//! runtime [`RuleSet`] and answers one question per request: is this request
//! exempt from authentication?
//!
//! # Evaluation
//!
//! Rules are walked in configured order. A rule is only considered when its
//! `domain` is exactly the request host (no wildcards, port included if the
//! host carries one). Inside a considered rule, an exclusion fires when its
//! subnet contains the source address **or** its regex matches the path.
//! The first exclusion that fires wins.
//!
//! A source address that cannot be parsed never matches a subnet. IP-based
//! bypass fails closed.

use std::net::{IpAddr, SocketAddr};

use ipnetwork::IpNetwork;
use regex::Regex;

use crate::config::{ExcludeConfig, RuleConfig};
use crate::{Error, Result};

/// A compiled bypass rule for one domain.
#[derive(Debug, Clone)]
pub struct Rule {
    domain: String,
    excludes: Vec<Exclusion>,
}

/// One exclusion inside a [`Rule`].
///
/// Either criterion alone is sufficient.
#[derive(Debug, Clone)]
pub struct Exclusion {
    source_subnet: Option<IpNetwork>,
    path_pattern: Option<Regex>,
}

/// Ordered, immutable set of compiled rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compile rules from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unparsable CIDR or regex. Compilation
    /// happens once at startup; a bad rule never reaches the request path.
    pub fn compile(configs: &[RuleConfig]) -> Result<Self> {
        let rules = configs
            .iter()
            .map(Rule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Decide whether the request bypasses authentication.
    #[must_use]
    pub fn should_bypass(&self, host: &str, path: &str, source: Option<IpAddr>) -> bool {
        self.rules
            .iter()
            .filter(|rule| rule.domain == host)
            .flat_map(|rule| rule.excludes.iter())
            .any(|exclusion| exclusion.matches(path, source))
    }

    /// Number of compiled rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` when no rules are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Rule {
    /// Compile a single rule.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any exclusion fails to compile.
    pub fn compile(config: &RuleConfig) -> Result<Self> {
        let excludes = config
            .excludes
            .iter()
            .map(|exclude| Exclusion::compile(exclude, &config.domain))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            domain: config.domain.clone(),
            excludes,
        })
    }
}

impl Exclusion {
    fn compile(config: &ExcludeConfig, domain: &str) -> Result<Self> {
        let source_subnet = match config.ipnet.as_deref().filter(|s| !s.is_empty()) {
            Some(cidr) => Some(cidr.parse::<IpNetwork>().map_err(|e| {
                Error::config(format!(
                    "failed to parse source ip range '{cidr}' for domain {domain}: {e}"
                ))
            })?),
            None => None,
        };

        let path_pattern = match config.path.as_deref().filter(|s| !s.is_empty()) {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                Error::config(format!(
                    "failed to compile rule regex '{pattern}' for domain {domain}: {e}"
                ))
            })?),
            None => None,
        };

        Ok(Self {
            source_subnet,
            path_pattern,
        })
    }

    fn matches(&self, path: &str, source: Option<IpAddr>) -> bool {
        let subnet_hit = match (self.source_subnet, source) {
            (Some(subnet), Some(addr)) => subnet.contains(addr),
            _ => false,
        };

        subnet_hit
            || self
                .path_pattern
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(path))
    }
}

/// Parse a source address as seen in `RemoteAddr` or `X-Forwarded-For`.
///
/// Accepts `ip`, `ip:port` and `[ipv6]:port`. Returns `None` for anything
/// else.
#[must_use]
pub fn parse_source_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if let Ok(addr) = raw.parse::<IpAddr>() {
        return Some(addr);
    }
    raw.parse::<SocketAddr>().ok().map(|sock| sock.ip())
}
