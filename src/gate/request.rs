//! What the gate sees of an inbound request.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::header::{AUTHORIZATION, HOST};
use axum::http::{HeaderMap, Request};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rustls::pki_types::CertificateDer;
use secrecy::SecretString;

use crate::mtls::PeerCertificates;
use crate::rules::parse_source_addr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PORT: &str = "x-forwarded-port";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_URI: &str = "x-forwarded-uri";

/// Credentials from an `Authorization: Basic` header.
pub struct BasicCredentials {
    /// Username as sent
    pub username: String,
    /// Password as sent
    pub password: SecretString,
}

impl BasicCredentials {
    /// Parse `Authorization: Basic <base64(user:password)>`.
    ///
    /// `None` when the header is missing, uses another scheme, or does not
    /// decode to UTF-8 `user:password`.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;

        Some(Self {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        })
    }
}

impl fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Request facts the authentication decision depends on.
#[derive(Debug)]
pub struct GateRequest<'a> {
    /// Target host, compared exactly against rule domains
    pub host: String,
    /// Target path, matched against exclusion patterns
    pub path: String,
    /// Client address; `None` when unknown or unparsable
    pub source: Option<IpAddr>,
    /// Where to send the client after a session is established
    pub location: String,
    /// Client certificate chain from the TLS handshake, leaf first
    pub certificates: &'a [CertificateDer<'static>],
    /// Basic credentials, if sent
    pub credentials: Option<BasicCredentials>,
    /// Request headers, for the session cookie
    pub headers: &'a HeaderMap,
}

impl<'a> GateRequest<'a> {
    /// Collect the gate's view of `request`.
    ///
    /// With `trust_forwarded` set, the client address, host, path and
    /// redirect target come from `X-Forwarded-*` headers where present.
    pub fn from_request<B>(request: &'a Request<B>, trust_forwarded: bool) -> Self {
        let headers = request.headers();
        let uri = request.uri();

        let socket_source = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let certificates = request
            .extensions()
            .get::<PeerCertificates>()
            .map_or(&[][..], PeerCertificates::as_slice);

        let direct_host = header_str(headers, HOST.as_str())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default();
        let direct_location = local_target(
            uri.path_and_query()
                .map_or_else(|| uri.path(), |pq| pq.as_str()),
        );

        let (host, path, source, location) = if trust_forwarded {
            let host = header_str(headers, X_FORWARDED_HOST)
                .map_or(direct_host, str::to_string);
            let forwarded_uri = header_str(headers, X_FORWARDED_URI);
            let path = forwarded_uri.map_or_else(
                || uri.path().to_string(),
                |u| u.split('?').next().unwrap_or(u).to_string(),
            );
            // Only the first X-Forwarded-For entry is the original client.
            let source = header_str(headers, X_FORWARDED_FOR)
                .and_then(|v| v.split(',').next())
                .map_or(socket_source, parse_source_addr);
            let location = forwarded_location(
                headers,
                &host,
                &forwarded_uri.map_or_else(|| direct_location.clone(), local_target),
            );
            (host, path, source, location)
        } else {
            (direct_host, uri.path().to_string(), socket_source, direct_location)
        };

        Self {
            host,
            path,
            source,
            location,
            certificates,
            credentials: BasicCredentials::from_headers(headers),
            headers,
        }
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Redirect target on the request's own host.
///
/// Leading `/` and `\` runs collapse to one `/`, so `//other.host/x` cannot
/// become a protocol-relative redirect and `@other.host` cannot turn into
/// userinfo once prefixed with a host.
fn local_target(raw: &str) -> String {
    format!("/{}", raw.trim_start_matches(['/', '\\']))
}

/// `proto://host[:port]uri` from the proxy's forwarded headers.
fn forwarded_location(headers: &HeaderMap, host: &str, uri: &str) -> String {
    let proto = header_str(headers, X_FORWARDED_PROTO).unwrap_or("http");
    let port = header_str(headers, X_FORWARDED_PORT)
        .filter(|port| !host.contains(':') && !is_default_port(proto, port));

    match port {
        Some(port) => format!("{proto}://{host}:{port}{uri}"),
        None => format!("{proto}://{host}{uri}"),
    }
}

fn is_default_port(proto: &str, port: &str) -> bool {
    matches!((proto, port), ("http", "80") | ("https", "443"))
}
