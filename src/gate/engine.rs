//! The per-request authentication decision.
//!
//! ```text
//!                 ┌─ bypass rule hit ─────────────────────────────► Forwarded
//! Unauthenticated ┼─ valid session ──────────────► Authenticated ─► Forwarded
//!                 ├─ certificates presented ─┬─ one verifies ─► save, redirect
//!                 │                          └─ none verify ──► 401
//!                 └─ no certificates ─► Challenging ─┬─ correct ─► save, redirect
//!                                                    └─ missing/wrong ─► 401 + challenge
//! ```
//!
//! Certificate and password authentication are exclusive per request: a
//! client that presented certificates is never asked for a password.

use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use tracing::{debug, error, info, warn};

use crate::config::{Config, validate_realm};
use crate::credentials::{CredentialVerifier, HtpasswdFile};
use crate::gate::request::GateRequest;
use crate::identity::{AuthMethod, Identity};
use crate::mtls::{TrustAnchor, try_authenticate};
use crate::rules::RuleSet;
use crate::session::{CookieOptions, CookieSessionStore, SessionKey, SessionStore};
use crate::{Error, Result};

/// Terminal state of one request's pass through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No identity could be established
    Unauthenticated,
    /// Basic credentials were requested or rejected
    Challenging,
    /// A new session was issued; the client is redirected to retry
    Authenticated,
    /// The request was passed to the next handler
    Forwarded,
}

impl GateState {
    /// Short label for logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Challenging => "challenging",
            Self::Authenticated => "authenticated",
            Self::Forwarded => "forwarded",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`AuthEngine::decide`].
#[derive(Debug)]
pub enum Decision {
    /// A bypass rule matched; forward without authentication.
    Bypass,
    /// The request carries a valid session; forward as this identity.
    Resume(Identity),
    /// Credentials were just verified and a session saved. Redirect to
    /// `location` with `headers` (the `Set-Cookie` lines) attached.
    Established {
        /// Newly authenticated identity
        identity: Identity,
        /// How it was authenticated
        method: AuthMethod,
        /// Original request URI
        location: String,
        /// Response headers carrying the session
        headers: HeaderMap,
    },
    /// Reject with 401, with a `WWW-Authenticate` value when Basic
    /// credentials could succeed.
    Unauthorized {
        /// `WWW-Authenticate` header value
        challenge: Option<HeaderValue>,
    },
    /// Verification succeeded but the session could not be saved.
    SessionFailure,
}

impl Decision {
    /// State the request ends in.
    #[must_use]
    pub fn state(&self) -> GateState {
        match self {
            Self::Bypass | Self::Resume(_) => GateState::Forwarded,
            Self::Established { .. } => GateState::Authenticated,
            Self::Unauthorized {
                challenge: Some(_),
            } => GateState::Challenging,
            Self::Unauthorized { challenge: None } | Self::SessionFailure => {
                GateState::Unauthenticated
            }
        }
    }

    /// `true` when the request goes on to the next handler.
    #[must_use]
    pub fn is_forwarded(&self) -> bool {
        self.state() == GateState::Forwarded
    }
}

/// Authentication engine shared by all requests.
///
/// Built once from configuration; holds only read-only state.
pub struct AuthEngine {
    rules: RuleSet,
    sessions: Arc<dyn SessionStore>,
    trust_anchor: Option<TrustAnchor>,
    credentials: Option<Arc<dyn CredentialVerifier>>,
    challenge: HeaderValue,
    domain: String,
    trust_forwarded_headers: bool,
}

impl AuthEngine {
    /// Engine with no rules, no trust anchor, no credential store and the
    /// `Restricted` realm.
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            rules: RuleSet::default(),
            sessions,
            trust_anchor: None,
            credentials: None,
            challenge: HeaderValue::from_static("Basic realm=\"Restricted\""),
            domain: String::new(),
            trust_forwarded_headers: false,
        }
    }

    /// Build the engine described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error for a bad rule, an unreadable or empty CA bundle or
    /// CRL, an unreadable users file, or an invalid realm.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let rules = RuleSet::compile(&config.rules)?;
        let key = SessionKey::from_config(config.cookie.key.as_deref())?;
        let sessions = CookieSessionStore::new(
            key,
            CookieOptions::from_config(&config.cookie, &config.domain),
        );

        let trust_anchor = match config.ca_path.as_deref() {
            Some(ca_path) => Some(TrustAnchor::from_pem_files(
                ca_path,
                config.crl_path.as_deref(),
            )?),
            None => {
                if config.crl_path.is_some() {
                    warn!("crl_path is set without ca_path; it has no effect");
                }
                None
            }
        };

        let credentials: Option<Arc<dyn CredentialVerifier>> =
            match (config.users.as_deref(), config.users_file.as_deref()) {
                (Some(inline), _) => Some(Arc::new(HtpasswdFile::parse(inline))),
                (None, Some(path)) => Some(Arc::new(HtpasswdFile::from_path(path)?)),
                (None, None) => None,
            };
        if !config.has_credentials() && trust_anchor.is_none() {
            warn!(
                domain = %config.domain,
                "Neither users nor ca_path is configured; only bypass rules can let requests through"
            );
        }

        let mut engine = Self::new(Arc::new(sessions))
            .with_rules(rules)
            .with_realm(&config.realm)?
            .with_domain(config.domain.clone())
            .trust_forwarded_headers(config.trust_forwarded_headers);
        if let Some(anchor) = trust_anchor {
            engine = engine.with_trust_anchor(anchor);
        }
        if let Some(store) = credentials {
            engine = engine.with_credentials(store);
        }

        info!(
            domain = %engine.domain,
            rules = engine.rules.len(),
            mtls = engine.trust_anchor.is_some(),
            basic = engine.credentials.is_some(),
            "Authentication engine ready"
        );
        Ok(engine)
    }

    /// Use these bypass rules
    #[must_use]
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Enable certificate authentication against `anchor`
    #[must_use]
    pub fn with_trust_anchor(mut self, anchor: TrustAnchor) -> Self {
        self.trust_anchor = Some(anchor);
        self
    }

    /// Enable Basic authentication against `store`
    #[must_use]
    pub fn with_credentials(mut self, store: Arc<dyn CredentialVerifier>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Realm advertised in the Basic challenge.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the realm cannot be sent in a header.
    pub fn with_realm(mut self, realm: &str) -> Result<Self> {
        validate_realm(realm)?;
        self.challenge = HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
            .map_err(|e| Error::config(format!("invalid realm '{realm}': {e}")))?;
        Ok(self)
    }

    /// Domain reported to authenticated clients
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Read request facts from `X-Forwarded-*` headers
    #[must_use]
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Whether `X-Forwarded-*` headers are trusted
    #[must_use]
    pub fn trusts_forwarded_headers(&self) -> bool {
        self.trust_forwarded_headers
    }

    /// Configured domain
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Decide what to do with one request.
    ///
    /// Never fails: every problem ends in a rejecting [`Decision`].
    pub async fn decide(&self, request: GateRequest<'_>) -> Decision {
        if self
            .rules
            .should_bypass(&request.host, &request.path, request.source)
        {
            debug!(host = %request.host, path = %request.path, "Bypass rule matched");
            return Decision::Bypass;
        }

        if let Some(identity) = self
            .sessions
            .load(request.headers)
            .filter(Identity::is_authenticated)
        {
            debug!(user = %identity, "Valid session");
            return Decision::Resume(identity);
        }

        if !request.certificates.is_empty() {
            return self.authenticate_certificate(&request);
        }

        self.authenticate_basic(request).await
    }

    fn authenticate_certificate(&self, request: &GateRequest<'_>) -> Decision {
        if self.trust_anchor.is_none() {
            warn!(
                host = %request.host,
                "Client certificate presented but no trust anchor is configured"
            );
        }

        match try_authenticate(request.certificates, self.trust_anchor.as_ref()) {
            Some(username) => self.establish(
                Identity::authenticated(username),
                AuthMethod::Mtls,
                request.location.clone(),
            ),
            None => {
                warn!(
                    host = %request.host,
                    source = ?request.source,
                    presented = request.certificates.len(),
                    "No client certificate verified"
                );
                Decision::Unauthorized { challenge: None }
            }
        }
    }

    async fn authenticate_basic(&self, request: GateRequest<'_>) -> Decision {
        let Some(store) = self.credentials.clone() else {
            warn!(host = %request.host, "No credential store configured");
            return Decision::Unauthorized { challenge: None };
        };

        let Some(credentials) = request.credentials else {
            debug!(host = %request.host, path = %request.path, "Requesting Basic credentials");
            return self.challenge();
        };

        let username = credentials.username.clone();
        let verified = tokio::task::spawn_blocking(move || {
            store.verify(
                &credentials.username,
                credentials.password.expose_secret(),
            )
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "Credential verification task failed");
            false
        });

        if verified {
            self.establish(
                Identity::authenticated(username),
                AuthMethod::Basic,
                request.location,
            )
        } else {
            warn!(user = %username, source = ?request.source, "Invalid credentials");
            self.challenge()
        }
    }

    fn challenge(&self) -> Decision {
        Decision::Unauthorized {
            challenge: Some(self.challenge.clone()),
        }
    }

    fn establish(&self, identity: Identity, method: AuthMethod, location: String) -> Decision {
        let mut headers = HeaderMap::new();
        match self.sessions.save(&identity, &mut headers) {
            Ok(()) => {
                info!(user = %identity, method = %method, "Session established");
                Decision::Established {
                    identity,
                    method,
                    location,
                    headers,
                }
            }
            Err(e) => {
                error!(user = %identity, error = %e, "Failed to save session");
                Decision::SessionFailure
            }
        }
    }
}

impl fmt::Debug for AuthEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthEngine")
            .field("domain", &self.domain)
            .field("rules", &self.rules.len())
            .field("trust_anchor", &self.trust_anchor)
            .field("credentials", &self.credentials.is_some())
            .field("trust_forwarded_headers", &self.trust_forwarded_headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExcludeConfig, RuleConfig};
    use axum::http::header::{COOKIE, SET_COOKIE};
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::gate::request::BasicCredentials;

    /// Counts calls so tests can assert a store was never consulted.
    #[derive(Default)]
    struct CountingStore {
        calls: AtomicUsize,
    }

    impl CredentialVerifier for CountingStore {
        fn verify(&self, username: &str, password: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            username == "alice" && password == "secret"
        }
    }

    /// Session store whose saves always fail.
    struct BrokenSessions;

    impl SessionStore for BrokenSessions {
        fn load(&self, _headers: &HeaderMap) -> Option<Identity> {
            None
        }

        fn save(&self, _identity: &Identity, _headers: &mut HeaderMap) -> Result<()> {
            Err(Error::Session("disk full".to_string()))
        }
    }

    fn sessions() -> Arc<CookieSessionStore> {
        let options = CookieOptions::from_config(&crate::config::CookieConfig::default(), "a.test");
        Arc::new(CookieSessionStore::new(SessionKey::new([7u8; 32]), options))
    }

    fn engine_with(store: Arc<CountingStore>) -> AuthEngine {
        AuthEngine::new(sessions()).with_credentials(store)
    }

    fn gate_request<'a>(headers: &'a HeaderMap, user_pass: Option<(&str, &str)>) -> GateRequest<'a> {
        GateRequest {
            host: "a.test".to_string(),
            path: "/private".to_string(),
            source: Some("192.0.2.1".parse().unwrap()),
            location: "/private?x=1".to_string(),
            certificates: &[],
            credentials: user_pass.map(|(username, password)| BasicCredentials {
                username: username.to_string(),
                password: SecretString::from(password.to_string()),
            }),
            headers,
        }
    }

    #[tokio::test]
    async fn correct_password_establishes_session_and_redirects() {
        let store = Arc::new(CountingStore::default());
        let engine = engine_with(Arc::clone(&store));
        let headers = HeaderMap::new();

        let decision = engine
            .decide(gate_request(&headers, Some(("alice", "secret"))))
            .await;

        let Decision::Established {
            identity,
            method,
            location,
            headers: response_headers,
        } = decision
        else {
            panic!("expected an established session");
        };
        assert_eq!(identity, Identity::authenticated("alice"));
        assert_eq!(method, AuthMethod::Basic);
        assert_eq!(location, "/private?x=1");
        assert!(response_headers.contains_key(SET_COOKIE));
    }

    #[tokio::test]
    async fn wrong_password_is_challenged() {
        let engine = engine_with(Arc::new(CountingStore::default()))
            .with_realm("Staff")
            .unwrap();
        let headers = HeaderMap::new();

        let decision = engine
            .decide(gate_request(&headers, Some(("alice", "wrong"))))
            .await;

        assert_eq!(decision.state(), GateState::Challenging);
        let Decision::Unauthorized {
            challenge: Some(challenge),
        } = decision
        else {
            panic!("expected a challenge");
        };
        assert_eq!(challenge, "Basic realm=\"Staff\"");
    }

    #[tokio::test]
    async fn missing_credentials_are_challenged_without_consulting_store() {
        let store = Arc::new(CountingStore::default());
        let engine = engine_with(Arc::clone(&store));
        let headers = HeaderMap::new();

        let decision = engine.decide(gate_request(&headers, None)).await;

        assert_eq!(decision.state(), GateState::Challenging);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_credential_store_fails_closed_without_challenge() {
        let engine = AuthEngine::new(sessions());
        let headers = HeaderMap::new();

        let decision = engine
            .decide(gate_request(&headers, Some(("alice", "secret"))))
            .await;

        assert!(matches!(decision, Decision::Unauthorized { challenge: None }));
        assert_eq!(decision.state(), GateState::Unauthenticated);
    }

    #[tokio::test]
    async fn bypass_skips_session_and_credentials() {
        // GIVEN: a rule exempting /private on a.test
        let rules = RuleSet::compile(&[RuleConfig {
            domain: "a.test".to_string(),
            excludes: vec![ExcludeConfig {
                path: Some("^/private$".to_string()),
                ipnet: None,
            }],
        }])
        .unwrap();
        let store = Arc::new(CountingStore::default());
        let engine = engine_with(Arc::clone(&store)).with_rules(rules);
        let headers = HeaderMap::new();

        // WHEN: a request with wrong credentials arrives
        let decision = engine
            .decide(gate_request(&headers, Some(("alice", "wrong"))))
            .await;

        // THEN: it is forwarded and the store was never asked
        assert!(matches!(decision, Decision::Bypass));
        assert!(decision.is_forwarded());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_session_resumes_without_reauthentication() {
        // GIVEN: a cookie issued by a previous successful login
        let store = Arc::new(CountingStore::default());
        let engine = engine_with(Arc::clone(&store));
        let first_headers = HeaderMap::new();
        let Decision::Established { headers, .. } = engine
            .decide(gate_request(&first_headers, Some(("alice", "secret"))))
            .await
        else {
            panic!("login failed");
        };
        let set_cookie = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        let pair = set_cookie.split(';').next().unwrap();

        let mut with_cookie = HeaderMap::new();
        with_cookie.insert(COOKIE, pair.parse().unwrap());

        // WHEN: the same client comes back twice, with and without bad credentials
        for creds in [None, Some(("alice", "wrong"))] {
            let decision = engine.decide(gate_request(&with_cookie, creds)).await;
            // THEN: the session is honoured each time
            assert!(matches!(decision, Decision::Resume(ref id) if id.username == "alice"));
        }
        // AND: only the original login touched the store
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn certificates_without_anchor_are_rejected_without_fallback() {
        let store = Arc::new(CountingStore::default());
        let engine = engine_with(Arc::clone(&store));
        let headers = HeaderMap::new();
        let chain = [rustls::pki_types::CertificateDer::from(vec![0u8; 4])];
        let mut request = gate_request(&headers, Some(("alice", "secret")));
        request.certificates = &chain;

        let decision = engine.decide(request).await;

        assert!(matches!(decision, Decision::Unauthorized { challenge: None }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn session_save_failure_is_reported() {
        let engine =
            AuthEngine::new(Arc::new(BrokenSessions)).with_credentials(Arc::new(CountingStore::default()));
        let headers = HeaderMap::new();

        let decision = engine
            .decide(gate_request(&headers, Some(("alice", "secret"))))
            .await;

        assert!(matches!(decision, Decision::SessionFailure));
        assert!(!decision.is_forwarded());
    }

    #[test]
    fn realm_with_quote_or_control_character_is_rejected() {
        for realm in ["a\"b", "tab\there", "line\nbreak"] {
            let result = AuthEngine::new(sessions()).with_realm(realm);
            assert!(
                matches!(result, Err(Error::Config(_))),
                "realm {realm:?} should be rejected"
            );
        }
    }

    #[test]
    fn builder_and_config_agree_on_realms() {
        for realm in ["Restricted", "Staff Only", "a\"b", "tab\there"] {
            let config = Config {
                domain: "a.test".to_string(),
                realm: realm.to_string(),
                ..Default::default()
            };
            assert_eq!(
                AuthEngine::new(sessions()).with_realm(realm).is_ok(),
                config.validate().is_ok(),
                "realm {realm:?}"
            );
        }
    }

    #[test]
    fn from_config_wires_inline_users_and_domain() {
        let config = Config {
            domain: "a.test".to_string(),
            users: Some("alice:{SHA}VBPuJHI7uixaa6LQGWx4s+5GKNE=".to_string()),
            ..Default::default()
        };
        let engine = AuthEngine::from_config(&config).unwrap();
        assert_eq!(engine.domain(), "a.test");
        assert!(engine.credentials.is_some());
        assert!(engine.trust_anchor.is_none());
        assert!(!engine.trusts_forwarded_headers());
    }

    #[test]
    fn from_config_without_any_method_only_warns() {
        // GIVEN: neither users nor ca_path
        let config = Config {
            domain: "a.test".to_string(),
            ..Default::default()
        };
        assert!(!config.has_credentials());
        // WHEN: building the engine
        let engine = AuthEngine::from_config(&config).unwrap();
        // THEN: it starts with no way to authenticate
        assert!(engine.credentials.is_none());
        assert!(engine.trust_anchor.is_none());
    }

    #[test]
    fn from_config_rejects_unreadable_ca_bundle() {
        let config = Config {
            domain: "a.test".to_string(),
            ca_path: Some("/nonexistent/ca.pem".to_string()),
            ..Default::default()
        };
        let err = AuthEngine::from_config(&config).unwrap_err();
        assert!(err.is_fatal());
    }
}
